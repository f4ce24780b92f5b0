mod context;
mod guard;
mod orchestrator;
mod recovery;
mod state;

pub use context::{CycleContext, CycleDisposition, CycleInput, CycleOutcome};
pub use guard::{CycleQuota, MessageRate, Unmetered, UsageGuard};
pub use orchestrator::Orchestrator;
pub use recovery::{DEESCALATION_MESSAGE, RecoveryProfile, SAFETY_MESSAGE};
pub use state::{ConfigError, CycleState, TransitionTable};
