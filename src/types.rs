// =============================================================================
// Shared types used across the Archer execution core
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction as it appears on the wire ("BUY" / "SELL").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Direction {
    /// The side that closes a position opened in this direction.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn is_long(self) -> bool {
        matches!(self, Self::Buy)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a trade's lifecycle ended. `Active` is the initial state of a freshly
/// opened trade; everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Active,
    TargetHit,
    StopHit,
    TimeoutWin,
    TimeoutLost,
    TimeoutBreakeven,
    ManualCloseWin,
    ManualCloseLost,
    ManualCloseBreakeven,
    GuardianClose,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::TargetHit => "target_hit",
            Self::StopHit => "stop_hit",
            Self::TimeoutWin => "timeout_win",
            Self::TimeoutLost => "timeout_lost",
            Self::TimeoutBreakeven => "timeout_breakeven",
            Self::ManualCloseWin => "manual_close_win",
            Self::ManualCloseLost => "manual_close_lost",
            Self::ManualCloseBreakeven => "manual_close_breakeven",
            Self::GuardianClose => "guardian_close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "target_hit" => Some(Self::TargetHit),
            "stop_hit" => Some(Self::StopHit),
            "timeout_win" => Some(Self::TimeoutWin),
            "timeout_lost" => Some(Self::TimeoutLost),
            "timeout_breakeven" => Some(Self::TimeoutBreakeven),
            "manual_close_win" => Some(Self::ManualCloseWin),
            "manual_close_lost" => Some(Self::ManualCloseLost),
            "manual_close_breakeven" => Some(Self::ManualCloseBreakeven),
            "guardian_close" => Some(Self::GuardianClose),
            _ => None,
        }
    }

    /// A trade is losing iff it ended at the stop, was manually closed at a
    /// loss, or timed out underwater.
    pub fn is_loss(self) -> bool {
        matches!(self, Self::StopHit | Self::ManualCloseLost | Self::TimeoutLost)
    }

    pub fn is_win(self) -> bool {
        matches!(self, Self::TargetHit | Self::TimeoutWin | Self::ManualCloseWin)
    }

    /// Only stop-outs and manual losing closes start the per-symbol cooldown.
    /// A timeout close already waited out its own window.
    pub fn triggers_cooldown(self) -> bool {
        matches!(self, Self::StopHit | Self::ManualCloseLost)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional analyzer metadata attached to a signal. Fields that are absent
/// mean "no opinion" — the corresponding rule sub-check is skipped, never
/// treated as the lowest rank.
///
/// Levels are carried as raw strings: rule thresholds come from per-user
/// config and an unrecognized value must pass fail-safe rather than fail
/// deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrokMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grok_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grok_probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grok_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grok_confidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grok_risk_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grok_timing_quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grok_key_factor: Option<String>,
}

/// An inbound trading signal, immutable once parsed.
///
/// Price ordering has already been validated at the wire boundary:
/// LONG requires `stop < entry < target`, SHORT the inverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub rr: f64,
    pub probability: f64,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ev: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated_probability: Option<f64>,
    #[serde(flatten)]
    pub grok: GrokMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Venue order ids for an installed entry + SL + TP triplet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OrderIds {
    pub entry: Option<u64>,
    pub sl: Option<u64>,
    pub tp: Option<u64>,
}

/// A fully opened trade as persisted to the trade store. Only the exit
/// fields, `pnl` and `updated_at` are mutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub user_id: String,
    pub strategy: String,
    pub direction: Direction,
    pub order_ids: OrderIds,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: f64,
    pub rr: f64,
    pub leverage: u32,
    pub capital_risked: f64,
    pub probability: f64,
    pub ev: Option<f64>,
    pub grok: GrokMeta,
    /// Snapshot of the user rules the trade was validated against.
    pub rules_snapshot: serde_json::Value,
    pub signal_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
}
