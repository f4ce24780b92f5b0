use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{PersonaStore, StoreError};
use crate::types::{CyclePersona, GrowthEntry, PersonaUpdate, TraitVector};

#[derive(Debug, Default, Clone)]
struct Record {
    persona: CyclePersona,
    log: Vec<GrowthEntry>,
}

/// In-process store. Used when no database is configured and in tests.
/// Nothing survives the process.
#[derive(Debug)]
pub struct EphemeralStore {
    records: RwLock<HashMap<String, Record>>,
    delta_window: usize,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    save_delay: Option<Duration>,
    saves: AtomicUsize,
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::new(4)
    }
}

impl EphemeralStore {
    pub fn new(delta_window: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            delta_window,
            fail_saves: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            save_delay: None,
            saves: AtomicUsize::new(0),
        }
    }

    /// Delay every save, for timeout tests.
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = Some(delay);
        self
    }

    /// Make subsequent saves fail as if the transport were down.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent loads fail as if the transport were down.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Seed a persona directly.
    pub async fn put(&self, identity: &str, persona: CyclePersona) {
        let mut records = self.records.write().await;
        records.entry(identity.to_string()).or_default().persona = persona;
    }

    pub async fn growth_log(&self, identity: &str) -> Vec<GrowthEntry> {
        self.records.read().await.get(identity).map(|r| r.log.clone()).unwrap_or_default()
    }

    /// Number of successful saves across all identities.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersonaStore for EphemeralStore {
    async fn load(&self, identity: &str) -> Result<CyclePersona, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("ephemeral store load disabled".into()));
        }
        let records = self.records.read().await;
        let Some(record) = records.get(identity) else {
            return Ok(CyclePersona::default());
        };
        let mut persona = record.persona.clone();
        let skip = record.log.len().saturating_sub(self.delta_window);
        persona.recent_deltas = record.log[skip..].iter().map(GrowthEntry::delta).collect();
        Ok(persona)
    }

    async fn save(&self, identity: &str, update: &PersonaUpdate) -> Result<(), StoreError> {
        if let Some(delay) = self.save_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("ephemeral store save disabled".into()));
        }
        let mut records = self.records.write().await;
        let record = records.entry(identity.to_string()).or_default();
        record.persona.traits = update.traits.coerce();
        record.persona.reflection = update.reflection.clone();
        record.persona.meta_summary = update.meta_summary.clone();
        record.persona.growth = update.growth;
        record.persona.updated_at = Some(update.updated_at);
        if let Some(entry) = &update.entry {
            record.log.push(entry.clone());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self, identity: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.entry(identity.to_string()).or_default();
        record.persona.traits = TraitVector::neutral();
        record.persona.updated_at = Some(chrono::Utc::now());
        Ok(())
    }
}
