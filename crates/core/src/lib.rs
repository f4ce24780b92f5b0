//! Persona cognitive cycle: trait model, safety stabilizer, self-referent
//! classification, three-stage reflection, and the orchestrator that runs
//! one bounded cycle per inbound utterance.

pub mod cognition;
pub mod config;
pub mod identity;
pub mod memory;
pub mod reflection;
pub mod runtime;
pub mod safety;
pub mod types;
