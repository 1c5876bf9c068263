// =============================================================================
// Per-user rule configuration
// =============================================================================
//
// Stored as JSON per (user_id, strategy) and deserialized on demand. Every
// field carries a serde default so older rule rows keep loading as the
// shape grows. Grok thresholds are optional: an unset threshold skips that
// sub-check entirely.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Grok quality levels
// ---------------------------------------------------------------------------

/// Ordered best→worst. A lower index is a better level.
pub const GROK_CONFIDENCE_LEVELS: [&str; 3] = ["HIGH", "MEDIUM", "LOW"];
pub const GROK_TIMING_LEVELS: [&str; 3] = ["OPTIMAL", "GOOD", "FAIR"];
/// Ordered best→worst for risk: LOW risk is best.
pub const GROK_RISK_LEVELS: [&str; 3] = ["LOW", "MEDIUM", "HIGH"];

pub const GROK_ACTION_ENTER: &str = "ENTER";

fn rank(levels: &[&str], value: &str) -> Option<usize> {
    let upper = value.to_uppercase();
    levels.iter().position(|l| *l == upper)
}

/// True when `actual` is at least as good as `minimum` on a best→worst
/// ordered list. Unrecognized values pass fail-safe.
pub fn meets_minimum_level(actual: &str, minimum: &str, levels: &[&str]) -> bool {
    match (rank(levels, actual), rank(levels, minimum)) {
        (Some(a), Some(m)) => a <= m,
        _ => true,
    }
}

/// True when `actual` does not exceed `maximum` on a best→worst ordered
/// list (used for risk, where a lower index means lower risk).
pub fn meets_maximum_level(actual: &str, maximum: &str, levels: &[&str]) -> bool {
    match (rank(levels, actual), rank(levels, maximum)) {
        (Some(a), Some(m)) => a <= m,
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_risk_pct() -> f64 {
    1.0
}

fn default_max_leverage() -> u32 {
    20
}

fn default_cooldown_hours() -> f64 {
    4.0
}

/// 999 means "no limit".
fn default_max_trades_open() -> u32 {
    999
}

fn default_min_probability() -> f64 {
    50.0
}

fn default_min_rr() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Allowed trading windows per UTC weekday. Keys are full weekday names
/// ("Monday"), values are lists of ["HH:MM", "HH:MM"] ranges. A weekday
/// with no entry is closed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub days: HashMap<String, Vec<Vec<String>>>,
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// One tier of the tiered circuit-breaker ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CbTier {
    pub consecutive_losses: u32,
    pub pause_hours: f64,
}

/// Circuit-breaker configuration. Two shapes are accepted:
///
/// Simple: `{ "enabled": true, "max_consecutive_losses": 5,
///            "pause_duration_hours": 4 }`
///
/// Tiered: `{ "enabled": true, "tiers": [
///            {"consecutive_losses": 3, "pause_hours": 2}, ... ] }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiers: Option<Vec<CbTier>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_losses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_duration_hours: Option<f64>,
}

impl CircuitBreakerConfig {
    /// Pause duration for the given loss run, or `None` when no threshold
    /// is reached. With tiers, the highest tier whose threshold is met
    /// applies.
    pub fn pause_hours_for(&self, consecutive_losses: u32) -> Option<f64> {
        if let Some(tiers) = &self.tiers {
            let mut sorted: Vec<CbTier> = tiers.clone();
            sorted.sort_by(|a, b| b.consecutive_losses.cmp(&a.consecutive_losses));
            return sorted
                .iter()
                .find(|t| consecutive_losses >= t.consecutive_losses)
                .map(|t| t.pause_hours);
        }

        let max_losses = self.max_consecutive_losses.unwrap_or(5);
        let pause_hours = self.pause_duration_hours.unwrap_or(4.0);
        (consecutive_losses >= max_losses).then_some(pause_hours)
    }
}

// ---------------------------------------------------------------------------
// UserRules
// ---------------------------------------------------------------------------

/// How concurrent-trade limits are counted. The limit gate itself counts
/// open positions in both cases; the field is carried for config
/// compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CountMethod {
    #[default]
    Positions,
    Orders,
}

/// The full rule set for one `(user_id, strategy)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRules {
    #[serde(default)]
    pub enabled: bool,

    // --- Sizing -------------------------------------------------------------
    #[serde(default = "default_risk_pct")]
    pub risk_pct: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,

    // --- Limits -------------------------------------------------------------
    #[serde(default = "default_max_trades_open")]
    pub max_trades_open: u32,
    #[serde(default)]
    pub count_method: CountMethod,

    // --- Cooldown -----------------------------------------------------------
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: f64,

    // --- Signal quality gates -----------------------------------------------
    #[serde(default = "default_min_probability")]
    pub min_probability: f64,
    #[serde(default = "default_min_rr")]
    pub min_rr: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_grok_confidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_grok_timing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_grok_risk: Option<String>,

    // --- Schedule & circuit breaker -----------------------------------------
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    // --- Guardian participation ---------------------------------------------
    #[serde(default = "default_true")]
    pub use_guardian: bool,
    #[serde(default)]
    pub use_guardian_half: bool,
}

impl Default for UserRules {
    fn default() -> Self {
        Self {
            enabled: false,
            risk_pct: default_risk_pct(),
            max_leverage: default_max_leverage(),
            max_trades_open: default_max_trades_open(),
            count_method: CountMethod::default(),
            cooldown_hours: default_cooldown_hours(),
            min_probability: default_min_probability(),
            min_rr: default_min_rr(),
            min_grok_confidence: None,
            min_grok_timing: None,
            max_grok_risk: None,
            schedule: None,
            circuit_breaker: None,
            use_guardian: true,
            use_guardian_half: false,
        }
    }
}
