pub mod denylist;
pub mod stabilizer;

pub use stabilizer::{StabilizerCfg, check_overload, composite, composite_with_history, stabilize};
