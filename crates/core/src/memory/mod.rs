//! Persistence gateway: the only durable store the core talks to.
//!
//! A cycle loads once at entry and saves once at exit. Missing records are
//! never an error; they read back as neutral defaults.

pub mod ephemeral;
pub mod postgres;

use async_trait::async_trait;
use std::time::Duration;

use crate::types::{CyclePersona, PersonaUpdate};

pub use ephemeral::EphemeralStore;
pub use postgres::PgPersonaStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PersonaStore: Send + Sync {
    /// Latest persona for `identity`; neutral defaults when no record exists.
    async fn load(&self, identity: &str) -> Result<CyclePersona, StoreError>;

    /// Write the cycle outcome and append its growth entry, if any.
    async fn save(&self, identity: &str, update: &PersonaUpdate) -> Result<(), StoreError>;

    /// Put traits back to neutral. Narrative history is kept.
    async fn reset(&self, identity: &str) -> Result<(), StoreError>;
}

/// Load with a deadline.
pub async fn load_within(
    store: &dyn PersonaStore,
    identity: &str,
    limit: Duration,
) -> Result<CyclePersona, StoreError> {
    match tokio::time::timeout(limit, store.load(identity)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Save with a deadline.
pub async fn save_within(
    store: &dyn PersonaStore,
    identity: &str,
    update: &PersonaUpdate,
    limit: Duration,
) -> Result<(), StoreError> {
    match tokio::time::timeout(limit, store.save(identity, update)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Load, degrading to neutral defaults on any failure.
/// Returns the persona and whether it came from the store.
pub async fn load_or_neutral(
    store: &dyn PersonaStore,
    identity: &str,
    limit: Duration,
) -> (CyclePersona, bool) {
    match load_within(store, identity, limit).await {
        Ok(mut persona) => {
            persona.traits = persona.traits.coerce();
            (persona, true)
        }
        Err(e) => {
            tracing::warn!(identity, error = %e, "persona load failed, using neutral defaults");
            (CyclePersona::default(), false)
        }
    }
}
