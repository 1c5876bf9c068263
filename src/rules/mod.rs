pub mod config;
pub mod engine;
pub mod schedule;

pub use config::{CbTier, CircuitBreakerConfig, Schedule, UserRules};
pub use engine::{RuleEngine, Verdict};
