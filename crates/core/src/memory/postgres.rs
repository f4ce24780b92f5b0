use async_trait::async_trait;
use sqlx::PgPool;

use super::{PersonaStore, StoreError};
use crate::types::{CyclePersona, PersonaUpdate, TraitVector};

/// Postgres-backed gateway over `persona_state` and `persona_growth_log`.
#[derive(Debug, Clone)]
pub struct PgPersonaStore {
    pool: PgPool,
    delta_window: i64,
}

impl PgPersonaStore {
    pub fn new(pool: PgPool, delta_window: usize) -> Self {
        Self { pool, delta_window: delta_window as i64 }
    }
}

#[async_trait]
impl PersonaStore for PgPersonaStore {
    async fn load(&self, identity: &str) -> Result<CyclePersona, StoreError> {
        let row = sqlx::query_as::<_, PersonaRow>(
            "SELECT calm, empathy, curiosity, reflection, meta_summary, growth, updated_at
             FROM persona_state WHERE identity_id = $1",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(CyclePersona::default());
        };

        let mut deltas = sqlx::query_as::<_, DeltaRow>(
            "SELECT delta_calm, delta_empathy, delta_curiosity
             FROM persona_growth_log WHERE identity_id = $1
             ORDER BY recorded_at DESC, id DESC LIMIT $2",
        )
        .bind(identity)
        .bind(self.delta_window)
        .fetch_all(&self.pool)
        .await?;
        deltas.reverse();

        let mut persona: CyclePersona = row.into();
        persona.recent_deltas =
            deltas.into_iter().map(|d| [d.delta_calm, d.delta_empathy, d.delta_curiosity]).collect();
        Ok(persona)
    }

    async fn save(&self, identity: &str, update: &PersonaUpdate) -> Result<(), StoreError> {
        let traits = update.traits.coerce();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO persona_state
                 (identity_id, calm, empathy, curiosity, reflection, meta_summary, growth, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (identity_id) DO UPDATE SET
                 calm = $2, empathy = $3, curiosity = $4, reflection = $5,
                 meta_summary = $6, growth = $7, updated_at = $8",
        )
        .bind(identity)
        .bind(traits.calm)
        .bind(traits.empathy)
        .bind(traits.curiosity)
        .bind(&update.reflection)
        .bind(&update.meta_summary)
        .bind(update.growth)
        .bind(update.updated_at)
        .execute(&mut *tx)
        .await?;

        if let Some(entry) = &update.entry {
            let d = entry.delta();
            let flags = serde_json::to_value(entry.flags).unwrap_or_default();
            let snapshot = serde_json::json!({
                "traits_before": entry.traits_before,
                "traits_after": entry.traits_after,
                "safety_triggered": entry.safety_triggered,
                "flagged": entry.flagged,
                "signals": entry.signals,
            });
            sqlx::query(
                "INSERT INTO persona_growth_log
                     (identity_id, recorded_at, delta_calm, delta_empathy, delta_curiosity,
                      growth_adjustment, final_state, next_focus, flags, snapshot)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(identity)
            .bind(entry.recorded_at)
            .bind(d[0])
            .bind(d[1])
            .bind(d[2])
            .bind(entry.growth_adjustment)
            .bind(&entry.final_state)
            .bind(&entry.next_focus)
            .bind(&flags)
            .bind(&snapshot)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reset(&self, identity: &str) -> Result<(), StoreError> {
        let n = TraitVector::neutral();
        sqlx::query(
            "INSERT INTO persona_state (identity_id, calm, empathy, curiosity, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (identity_id) DO UPDATE SET
                 calm = $2, empathy = $3, curiosity = $4, updated_at = now()",
        )
        .bind(identity)
        .bind(n.calm)
        .bind(n.empathy)
        .bind(n.curiosity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct PersonaRow {
    calm: f32,
    empathy: f32,
    curiosity: f32,
    reflection: String,
    meta_summary: String,
    growth: f32,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<PersonaRow> for CyclePersona {
    fn from(r: PersonaRow) -> Self {
        Self {
            traits: TraitVector::new(r.calm, r.empathy, r.curiosity),
            reflection: r.reflection,
            meta_summary: r.meta_summary,
            growth: if r.growth.is_finite() { r.growth.clamp(0.0, 1.0) } else { 0.0 },
            updated_at: Some(r.updated_at),
            recent_deltas: Vec::new(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeltaRow {
    delta_calm: f32,
    delta_empathy: f32,
    delta_curiosity: f32,
}
