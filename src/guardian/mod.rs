// =============================================================================
// Guardian — external monitor actions fanned out across the user fleet
// =============================================================================

pub mod dispatcher;
pub mod freshness;

use serde::{Deserialize, Serialize};

use crate::exec::adjuster::LevelMetadata;
use crate::types::Direction;

/// Action requested by the guardian monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardianAction {
    Close,
    Adjust,
    HalfClose,
}

impl GuardianAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Close => "CLOSE",
            Self::Adjust => "ADJUST",
            Self::HalfClose => "HALF_CLOSE",
        }
    }
}

/// Market state at the moment the guardian made its decision.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MarketContext {
    #[serde(default)]
    pub trigger_price: f64,
    /// Decision time as UNIX epoch seconds.
    #[serde(default)]
    pub timestamp: f64,
}

/// Stops the guardian pre-computed for likely price drifts, so a drifted
/// adjust can execute without a round-trip back to the monitor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PriceScenarios {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_stop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_price_up_0_5_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_price_down_0_5_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_price_up_1_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_price_down_1_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_acceptable_drift_pct: Option<f64>,
}

/// The full guardian request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianEnvelope {
    pub action: GuardianAction,
    pub symbol: String,
    #[serde(default)]
    pub market_context: MarketContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_scenarios: Option<PriceScenarios>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_acceptable_drift_pct: Option<f64>,
    /// Direct stop for `adjust` when no recomputation is needed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<f64>,
    /// Entry and side, used only by the half-close profit check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_metadata: Option<LevelMetadata>,
}

impl GuardianEnvelope {
    /// Acceptable price drift before an adjust stop is recomputed.
    pub fn max_drift_pct(&self) -> f64 {
        self.max_acceptable_drift_pct
            .or_else(|| self.price_scenarios.and_then(|s| s.max_acceptable_drift_pct))
            .unwrap_or(1.0)
    }
}
