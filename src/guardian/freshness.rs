// =============================================================================
// Guardian freshness re-validation
// =============================================================================
//
// A guardian decision was made against a price that may already be stale by
// the time it reaches a user's account. Each action tolerates a different
// amount of drift:
//
//   close      — urgency wins; reject only when older than 60 s.
//   adjust     — reject past 45 s; price drift beyond the acceptable band
//                swaps in a pre-computed scenario stop.
//   half_close — reject past 90 s; when entry/side are known the trade must
//                still be in profit.
// =============================================================================

use tracing::{debug, warn};

use crate::types::Direction;

use super::{GuardianAction, GuardianEnvelope, PriceScenarios};

const CLOSE_MAX_AGE_SEC: f64 = 60.0;
const ADJUST_MAX_AGE_SEC: f64 = 45.0;
const HALF_CLOSE_MAX_AGE_SEC: f64 = 90.0;

/// Result of re-validating a guardian decision against fresh data.
#[derive(Debug, Clone, PartialEq)]
pub enum FreshnessVerdict {
    /// Execute; `adjusted_stop` replaces the envelope stop when drift
    /// forced a recomputation.
    Proceed {
        note: String,
        adjusted_stop: Option<f64>,
    },
    Reject { reason: String },
}

impl FreshnessVerdict {
    fn proceed(note: impl Into<String>) -> Self {
        Self::Proceed {
            note: note.into(),
            adjusted_stop: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }
}

/// Validate the envelope against a freshly fetched mark price.
/// `now_epoch` is the current time in UNIX epoch seconds.
pub fn validate(envelope: &GuardianEnvelope, mark_price: f64, now_epoch: f64) -> FreshnessVerdict {
    let trigger_price = envelope.market_context.trigger_price;
    let trigger_ts = envelope.market_context.timestamp;

    if trigger_price <= 0.0 || mark_price <= 0.0 {
        return FreshnessVerdict::proceed("no_price_data_for_validation");
    }

    let price_drift_pct = (mark_price - trigger_price).abs() / trigger_price * 100.0;
    let time_drift_sec = now_epoch - trigger_ts;
    debug!(
        action = envelope.action.as_str(),
        price_drift_pct,
        time_drift_sec,
        "guardian freshness check"
    );

    match envelope.action {
        GuardianAction::Close => {
            if time_drift_sec > CLOSE_MAX_AGE_SEC {
                return FreshnessVerdict::reject(format!("close_too_stale_{time_drift_sec:.1}s"));
            }
            if price_drift_pct > 2.0 {
                warn!(price_drift_pct, "significant drift for CLOSE, executing anyway");
            }
            FreshnessVerdict::proceed("close_validated")
        }

        GuardianAction::Adjust => {
            if time_drift_sec > ADJUST_MAX_AGE_SEC {
                return FreshnessVerdict::reject(format!("adjust_too_stale_{time_drift_sec:.1}s"));
            }

            if price_drift_pct > envelope.max_drift_pct() {
                let scenarios = envelope.price_scenarios.unwrap_or_default();
                return match scenario_stop(&scenarios, mark_price, trigger_price) {
                    Some(stop) => FreshnessVerdict::Proceed {
                        note: format!("stop_recalculated_drift_{price_drift_pct:.3}%"),
                        adjusted_stop: Some(stop),
                    },
                    None => FreshnessVerdict::reject(format!(
                        "adjust_drift_too_high_{price_drift_pct:.3}%"
                    )),
                };
            }

            FreshnessVerdict::proceed("adjust_validated")
        }

        GuardianAction::HalfClose => {
            if time_drift_sec > HALF_CLOSE_MAX_AGE_SEC {
                return FreshnessVerdict::reject(format!(
                    "half_close_too_stale_{time_drift_sec:.1}s"
                ));
            }

            // The guardian already confirmed the 50% touch on 1m candles;
            // here only "still in profit" matters.
            let (Some(entry), Some(side)) = (envelope.entry, envelope.side) else {
                return FreshnessVerdict::proceed("half_close_validated_legacy");
            };

            let in_profit = match side {
                Direction::Buy => mark_price > entry,
                Direction::Sell => mark_price < entry,
            };
            if !in_profit {
                return FreshnessVerdict::reject(format!(
                    "half_close_no_profit_{}_price_{mark_price:.6}_entry_{entry:.6}",
                    side.as_str().to_lowercase()
                ));
            }

            FreshnessVerdict::proceed("half_close_validated")
        }
    }
}

/// Pick the pre-computed stop matching the observed drift band. Falls back
/// to the original stop outside the pre-computed bands.
pub fn scenario_stop(
    scenarios: &PriceScenarios,
    current_price: f64,
    trigger_price: f64,
) -> Option<f64> {
    let original_stop = scenarios.original_stop.filter(|s| *s > 0.0)?;

    let change_pct = (current_price - trigger_price) / trigger_price * 100.0;
    let magnitude = change_pct.abs();

    let stop = if (0.4..=0.6).contains(&magnitude) {
        if change_pct > 0.0 {
            scenarios.if_price_up_0_5_pct
        } else {
            scenarios.if_price_down_0_5_pct
        }
    } else if (0.8..=1.2).contains(&magnitude) {
        if change_pct > 0.0 {
            scenarios.if_price_up_1_pct
        } else {
            scenarios.if_price_down_1_pct
        }
    } else {
        None
    };

    Some(stop.unwrap_or(original_stop))
}
