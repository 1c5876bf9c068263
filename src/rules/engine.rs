// =============================================================================
// Rule engine — per-user pre-trade validation
// =============================================================================
//
// Deterministic gate pipeline evaluated in a fixed order; the first failing
// gate returns. Every rejection is rendered as a `component:detail` string
// for observability. The only silent approvals are the explicit fail-safe
// cases: store errors during history reads and venue errors during the
// position fetch default to "allow" (logged), and unrecognized grok level
// values pass.
//
// Gates:
//   1. Enabled        — rules.enabled
//   2. Schedule       — UTC weekday/time windows
//   3. CircuitBreaker — pause after N consecutive losses (simple or tiered)
//   4. Cooldown       — per-symbol wait after a losing exit
//   5. TradeLimits    — existing position + concurrent-trade cap
//   6. SignalQuality  — probability, RR, grok filters
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::store::HistoryRepo;
use crate::types::Signal;
use crate::venue::VenueClient;

use super::config::{
    meets_maximum_level, meets_minimum_level, UserRules, GROK_ACTION_ENTER,
    GROK_CONFIDENCE_LEVELS, GROK_RISK_LEVELS, GROK_TIMING_LEVELS,
};
use super::schedule;

/// Outcome of a rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Rejected(String),
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Approved => "approved",
            Self::Rejected(r) => r,
        }
    }
}

pub struct RuleEngine;

impl RuleEngine {
    /// Validate a candidate signal against one user's rules and historical
    /// state.
    pub async fn validate(
        history: &dyn HistoryRepo,
        venue: &dyn VenueClient,
        user_id: &str,
        strategy: &str,
        rules: &UserRules,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Verdict {
        // ── 1. Enabled ──────────────────────────────────────────────────
        if !rules.enabled {
            return Verdict::Rejected("user_disabled".to_string());
        }

        // ── 2. Schedule ─────────────────────────────────────────────────
        if let Some(sched) = &rules.schedule {
            if sched.enabled {
                if let Err(detail) = schedule::check(sched, now) {
                    return Verdict::Rejected(format!("schedule:{detail}"));
                }
            }
        }

        // ── 3. Circuit breaker ──────────────────────────────────────────
        if let Some(cb) = &rules.circuit_breaker {
            if cb.enabled {
                if let Some(reason) =
                    Self::check_circuit_breaker(history, user_id, strategy, cb, now)
                {
                    return Verdict::Rejected(reason);
                }
            }
        }

        // ── 4. Per-symbol cooldown ──────────────────────────────────────
        if rules.cooldown_hours > 0.0 {
            if let Some(reason) = Self::check_cooldown(
                history,
                user_id,
                strategy,
                &signal.symbol,
                rules.cooldown_hours,
                now,
            ) {
                return Verdict::Rejected(reason);
            }
        }

        // ── 5. Trade limits ─────────────────────────────────────────────
        if let Some(reason) =
            Self::check_trade_limits(venue, user_id, &signal.symbol, rules.max_trades_open).await
        {
            return Verdict::Rejected(reason);
        }

        // ── 6. Signal quality ───────────────────────────────────────────
        if let Some(reason) = Self::check_signal_quality(rules, signal) {
            return Verdict::Rejected(format!("signal_quality:{reason}"));
        }

        debug!(user_id, symbol = %signal.symbol, "all rule gates passed");
        Verdict::Approved
    }

    fn check_circuit_breaker(
        history: &dyn HistoryRepo,
        user_id: &str,
        strategy: &str,
        cb: &super::config::CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let (losses, last_loss) = match history.consecutive_losses(user_id, strategy) {
            Ok(v) => v,
            Err(e) => {
                // Store failure must not block trading.
                warn!(user_id, strategy, error = %e, "consecutive-loss read failed, allowing");
                return None;
            }
        };

        let last_loss = last_loss?;
        if losses == 0 {
            return None;
        }

        let pause_hours = cb.pause_hours_for(losses)?;
        let pause_until = last_loss + Duration::milliseconds((pause_hours * 3_600_000.0) as i64);

        if now < pause_until {
            let remaining_h = (pause_until - now).num_seconds() as f64 / 3600.0;
            return Some(format!(
                "circuit_breaker:paused:{losses}_losses:remaining_{remaining_h:.1}h"
            ));
        }

        None
    }

    fn check_cooldown(
        history: &dyn HistoryRepo,
        user_id: &str,
        strategy: &str,
        symbol: &str,
        cooldown_hours: f64,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let last = match history.last_trade_for_symbol(user_id, strategy, symbol) {
            Ok(v) => v,
            Err(e) => {
                warn!(user_id, symbol, error = %e, "last-trade read failed, allowing");
                return None;
            }
        };

        let (exit_reason, exit_time) = last?;
        if !exit_reason.triggers_cooldown() {
            return None;
        }

        let hours_since = (now - exit_time).num_seconds() as f64 / 3600.0;
        if hours_since < cooldown_hours {
            let remaining = cooldown_hours - hours_since;
            return Some(format!(
                "cooldown:{}:{}:{hours_since:.1}h_ago:remaining_{remaining:.1}h",
                symbol.to_lowercase(),
                exit_reason
            ));
        }

        None
    }

    /// One venue call answers both limit questions: does a position for this
    /// symbol already exist, and is the concurrent-position cap reached.
    async fn check_trade_limits(
        venue: &dyn VenueClient,
        user_id: &str,
        symbol: &str,
        max_trades_open: u32,
    ) -> Option<String> {
        let positions = match venue.positions(None).await {
            Ok(p) => p,
            Err(e) => {
                // Fail-safe: a venue hiccup here must not block the trade;
                // the executor revalidates before placing anything.
                warn!(user_id, symbol, error = %e, "position fetch failed, allowing");
                return None;
            }
        };

        let symbol_upper = symbol.to_uppercase();
        let open: Vec<&str> = positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.symbol.as_str())
            .collect();

        if open.iter().any(|s| s.eq_ignore_ascii_case(&symbol_upper)) {
            return Some(format!("trade_limits:position_exists:{symbol_upper}"));
        }

        let count = open.len() as u32;
        if max_trades_open < 999 && count >= max_trades_open {
            return Some(format!("trade_limits:max_exceeded:{count}/{max_trades_open}"));
        }

        None
    }

    fn check_signal_quality(rules: &UserRules, signal: &Signal) -> Option<String> {
        if signal.probability < rules.min_probability {
            return Some(format!(
                "probability:{}<{}",
                signal.probability, rules.min_probability
            ));
        }

        if signal.rr < rules.min_rr {
            return Some(format!("rr:{:.2}<{}", signal.rr, rules.min_rr));
        }

        // WAIT and REJECT both block; a missing action means no opinion.
        if let Some(action) = &signal.grok.grok_action {
            if !action.eq_ignore_ascii_case(GROK_ACTION_ENTER) {
                return Some(format!("grok_action:{action}"));
            }
        }

        if let (Some(min), Some(actual)) =
            (&rules.min_grok_confidence, &signal.grok.grok_confidence)
        {
            if !meets_minimum_level(actual, min, &GROK_CONFIDENCE_LEVELS) {
                return Some(format!("grok_confidence:{actual}<{min}"));
            }
        }

        if let (Some(min), Some(actual)) =
            (&rules.min_grok_timing, &signal.grok.grok_timing_quality)
        {
            if !meets_minimum_level(actual, min, &GROK_TIMING_LEVELS) {
                return Some(format!("grok_timing:{actual}<{min}"));
            }
        }

        if let (Some(max), Some(actual)) = (&rules.max_grok_risk, &signal.grok.grok_risk_level) {
            if !meets_maximum_level(actual, max, &GROK_RISK_LEVELS) {
                return Some(format!("grok_risk:{actual}>{max}"));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use anyhow::Result;
    use chrono::TimeZone;

    use super::*;
    use crate::rules::config::{CbTier, CircuitBreakerConfig};
    use crate::types::{Direction, ExitReason, GrokMeta};
    use crate::venue::mock::MockVenue;

    /// History fake with scripted answers.
    #[derive(Default)]
    struct FakeHistory {
        last_trade: Option<(ExitReason, DateTime<Utc>)>,
        losses: (u32, Option<DateTime<Utc>>),
        fail: bool,
    }

    impl HistoryRepo for FakeHistory {
        fn last_trade_for_symbol(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Option<(ExitReason, DateTime<Utc>)>> {
            if self.fail {
                anyhow::bail!("store down");
            }
            Ok(self.last_trade)
        }

        fn consecutive_losses(&self, _: &str, _: &str) -> Result<(u32, Option<DateTime<Utc>>)> {
            if self.fail {
                anyhow::bail!("store down");
            }
            Ok(self.losses)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
    }

    fn signal(symbol: &str) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            direction: Direction::Buy,
            entry: 50000.0,
            stop: 49500.0,
            target: 51000.0,
            rr: 2.0,
            probability: 70.0,
            strategy: "archer_model".to_string(),
            ev: None,
            simulated_probability: None,
            grok: GrokMeta::default(),
            timestamp: None,
        }
    }

    fn enabled_rules() -> UserRules {
        UserRules {
            enabled: true,
            ..UserRules::default()
        }
    }

    async fn run(history: &FakeHistory, venue: &MockVenue, rules: &UserRules, sig: &Signal) -> Verdict {
        RuleEngine::validate(history, venue, "u1", "archer_model", rules, sig, now()).await
    }

    #[tokio::test]
    async fn disabled_user_is_rejected_first() {
        let venue = MockVenue::new("BTCUSDT");
        let verdict = run(
            &FakeHistory::default(),
            &venue,
            &UserRules::default(),
            &signal("BTCUSDT"),
        )
        .await;
        assert_eq!(verdict, Verdict::Rejected("user_disabled".to_string()));
        assert_eq!(venue.total_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cooldown_blocks_with_exact_reason_and_no_venue_call() {
        let history = FakeHistory {
            last_trade: Some((ExitReason::StopHit, now() - Duration::hours(2))),
            ..Default::default()
        };
        let mut rules = enabled_rules();
        rules.cooldown_hours = 6.0;

        let venue = MockVenue::new("ETHUSDT");
        let verdict = run(&history, &venue, &rules, &signal("ETHUSDT")).await;

        assert_eq!(
            verdict,
            Verdict::Rejected("cooldown:ethusdt:stop_hit:2.0h_ago:remaining_4.0h".to_string())
        );
        // Rejected before the trade-limits gate: no venue traffic at all.
        assert_eq!(venue.total_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_lost_does_not_trigger_cooldown() {
        let history = FakeHistory {
            last_trade: Some((ExitReason::TimeoutLost, now() - Duration::hours(1))),
            ..Default::default()
        };
        let mut rules = enabled_rules();
        rules.cooldown_hours = 6.0;

        let venue = MockVenue::new("ETHUSDT");
        assert!(run(&history, &venue, &rules, &signal("ETHUSDT")).await.is_approved());
    }

    #[tokio::test]
    async fn expired_cooldown_allows() {
        let history = FakeHistory {
            last_trade: Some((ExitReason::ManualCloseLost, now() - Duration::hours(7))),
            ..Default::default()
        };
        let mut rules = enabled_rules();
        rules.cooldown_hours = 6.0;

        let venue = MockVenue::new("ETHUSDT");
        assert!(run(&history, &venue, &rules, &signal("ETHUSDT")).await.is_approved());
    }

    #[tokio::test]
    async fn tiered_circuit_breaker_applies_highest_matching_tier() {
        let history = FakeHistory {
            losses: (6, Some(now() - Duration::hours(3))),
            ..Default::default()
        };
        let mut rules = enabled_rules();
        rules.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            tiers: Some(vec![
                CbTier { consecutive_losses: 3, pause_hours: 2.0 },
                CbTier { consecutive_losses: 5, pause_hours: 8.0 },
                CbTier { consecutive_losses: 8, pause_hours: 12.0 },
                CbTier { consecutive_losses: 10, pause_hours: 24.0 },
            ]),
            ..Default::default()
        });

        let venue = MockVenue::new("BTCUSDT");
        let verdict = run(&history, &venue, &rules, &signal("BTCUSDT")).await;
        assert_eq!(
            verdict,
            Verdict::Rejected("circuit_breaker:paused:6_losses:remaining_5.0h".to_string())
        );
    }

    #[tokio::test]
    async fn circuit_breaker_pause_expires() {
        let history = FakeHistory {
            losses: (6, Some(now() - Duration::hours(9))),
            ..Default::default()
        };
        let mut rules = enabled_rules();
        rules.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            tiers: Some(vec![CbTier { consecutive_losses: 5, pause_hours: 8.0 }]),
            ..Default::default()
        });

        let venue = MockVenue::new("BTCUSDT");
        assert!(run(&history, &venue, &rules, &signal("BTCUSDT")).await.is_approved());
    }

    #[tokio::test]
    async fn below_every_tier_threshold_allows() {
        let history = FakeHistory {
            losses: (2, Some(now() - Duration::minutes(5))),
            ..Default::default()
        };
        let mut rules = enabled_rules();
        rules.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            tiers: Some(vec![CbTier { consecutive_losses: 3, pause_hours: 2.0 }]),
            ..Default::default()
        });

        let venue = MockVenue::new("BTCUSDT");
        assert!(run(&history, &venue, &rules, &signal("BTCUSDT")).await.is_approved());
    }

    #[tokio::test]
    async fn existing_position_blocks() {
        let venue = MockVenue::new("BTCUSDT");
        venue.set_position(0.5, 50000.0, 0.0);

        let verdict = run(
            &FakeHistory::default(),
            &venue,
            &enabled_rules(),
            &signal("BTCUSDT"),
        )
        .await;
        assert_eq!(
            verdict,
            Verdict::Rejected("trade_limits:position_exists:BTCUSDT".to_string())
        );
    }

    #[tokio::test]
    async fn max_open_trades_blocks() {
        let venue = MockVenue::new("ETHUSDT");
        // Two open positions on other symbols.
        *venue.positions.lock() = vec![
            crate::venue::PositionInfo {
                symbol: "BTCUSDT".into(),
                position_amt: 0.5,
                entry_price: 50000.0,
                unrealized_pnl: 0.0,
            },
            crate::venue::PositionInfo {
                symbol: "SOLUSDT".into(),
                position_amt: -3.0,
                entry_price: 150.0,
                unrealized_pnl: 0.0,
            },
        ];

        let mut rules = enabled_rules();
        rules.max_trades_open = 2;

        let verdict = run(&FakeHistory::default(), &venue, &rules, &signal("ETHUSDT")).await;
        assert_eq!(
            verdict,
            Verdict::Rejected("trade_limits:max_exceeded:2/2".to_string())
        );
    }

    #[tokio::test]
    async fn venue_failure_on_positions_is_fail_safe_allow() {
        let venue = MockVenue::new("BTCUSDT");
        *venue.fail_positions.lock() =
            Some(crate::error::VenueError::transient("position fetch down"));

        assert!(run(
            &FakeHistory::default(),
            &venue,
            &enabled_rules(),
            &signal("BTCUSDT")
        )
        .await
        .is_approved());
    }

    #[tokio::test]
    async fn store_failure_is_fail_safe_allow() {
        let history = FakeHistory {
            fail: true,
            ..Default::default()
        };
        let mut rules = enabled_rules();
        rules.circuit_breaker = Some(CircuitBreakerConfig {
            enabled: true,
            tiers: Some(vec![CbTier { consecutive_losses: 1, pause_hours: 24.0 }]),
            ..Default::default()
        });

        let venue = MockVenue::new("BTCUSDT");
        assert!(run(&history, &venue, &rules, &signal("BTCUSDT")).await.is_approved());
    }

    #[tokio::test]
    async fn probability_and_rr_gates() {
        let venue = MockVenue::new("BTCUSDT");
        let mut rules = enabled_rules();
        rules.min_probability = 75.0;

        let verdict = run(&FakeHistory::default(), &venue, &rules, &signal("BTCUSDT")).await;
        assert_eq!(
            verdict,
            Verdict::Rejected("signal_quality:probability:70<75".to_string())
        );

        let mut rules = enabled_rules();
        rules.min_rr = 2.5;
        let verdict = run(&FakeHistory::default(), &venue, &rules, &signal("BTCUSDT")).await;
        assert_eq!(
            verdict,
            Verdict::Rejected("signal_quality:rr:2.00<2.5".to_string())
        );
    }

    #[tokio::test]
    async fn grok_wait_blocks_and_missing_fields_skip() {
        let venue = MockVenue::new("BTCUSDT");
        let mut sig = signal("BTCUSDT");
        sig.grok.grok_action = Some("WAIT".to_string());

        let verdict = run(&FakeHistory::default(), &venue, &enabled_rules(), &sig).await;
        assert_eq!(
            verdict,
            Verdict::Rejected("signal_quality:grok_action:WAIT".to_string())
        );

        // Threshold configured but the signal has no opinion: skip.
        let mut rules = enabled_rules();
        rules.min_grok_confidence = Some("HIGH".to_string());
        assert!(run(
            &FakeHistory::default(),
            &venue,
            &rules,
            &signal("BTCUSDT")
        )
        .await
        .is_approved());
    }

    #[tokio::test]
    async fn grok_level_gates_enforce_rank() {
        let venue = MockVenue::new("BTCUSDT");
        let mut rules = enabled_rules();
        rules.min_grok_confidence = Some("MEDIUM".to_string());
        rules.max_grok_risk = Some("MEDIUM".to_string());

        let mut sig = signal("BTCUSDT");
        sig.grok.grok_action = Some("ENTER".to_string());
        sig.grok.grok_confidence = Some("LOW".to_string());

        let verdict = run(&FakeHistory::default(), &venue, &rules, &sig).await;
        assert_eq!(
            verdict,
            Verdict::Rejected("signal_quality:grok_confidence:LOW<MEDIUM".to_string())
        );

        sig.grok.grok_confidence = Some("HIGH".to_string());
        sig.grok.grok_risk_level = Some("HIGH".to_string());
        let verdict = run(&FakeHistory::default(), &venue, &rules, &sig).await;
        assert_eq!(
            verdict,
            Verdict::Rejected("signal_quality:grok_risk:HIGH>MEDIUM".to_string())
        );

        // Unrecognized level passes fail-safe.
        sig.grok.grok_risk_level = Some("UNKNOWN".to_string());
        assert!(run(&FakeHistory::default(), &venue, &rules, &sig).await.is_approved());
    }
}
