pub mod adjuster;
pub mod guard;
pub mod orphans;
pub mod reprice;
pub mod rounding;

pub use adjuster::StopAdjuster;
pub use guard::{ExecStep, OpenResult, PositionGuard};
