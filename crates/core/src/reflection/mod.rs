//! Three-stage reflection over each exchange.
//!
//! Reflect narrates the exchange, Introspect deepens it, Meta-Reflect turns
//! it into a growth proposal. Consolidation folds the result into the
//! persona's traits under the strict stabilizer profile. Each stage contains
//! its own failures and always yields a value.

pub mod introspect;
pub mod meta;
pub mod parse;
pub mod pipeline;
pub mod reflect;
pub mod stage;
pub mod tone;

pub use meta::MetaProposal;
pub use pipeline::{ConsolidationInput, ReflectionPipeline, blend_growth};
pub use stage::StageOutcome;
pub use tone::{NarrativeTone, PlainTone};
