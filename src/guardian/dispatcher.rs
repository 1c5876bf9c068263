// =============================================================================
// GuardianDispatcher — fan one guardian decision out across the fleet
// =============================================================================
//
// Concurrency policy is chosen per action:
//   close      — parallel, one task per user (10 s per task, 15 s total);
//                closing fast matters more than fresh validation.
//   adjust     — sequential with 300 ms spacing; every user gets a freshly
//                fetched mark price and an independent staleness check.
//   half_close — sequential with 500 ms spacing and the strictest checks.
//
// Users opt out via rules: `use_guardian=false` skips the user entirely,
// and half_close additionally requires `use_guardian_half=true`.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, timeout_at, Duration, Instant};
use tracing::{info, warn};

use crate::exec::StopAdjuster;
use crate::exec::orphans;
use crate::fleet::{Fleet, UserAccount};
use crate::market::PriceView;
use crate::rules::UserRules;
use crate::store::live_trade::LiveTradeStore;
use crate::store::{RulesRepo, TradeRepo};
use crate::types::{Direction, ExitReason};
use crate::venue::VenueClient;

use super::freshness::{self, FreshnessVerdict};
use super::{GuardianAction, GuardianEnvelope};

/// The strategy bucket guardian actions resolve rules against.
pub const GUARDIAN_STRATEGY: &str = "archer_model";

const CLOSE_TASK_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TOTAL_TIMEOUT: Duration = Duration::from_secs(15);
const ADJUST_SPACING: Duration = Duration::from_millis(300);
const HALF_CLOSE_SPACING: Duration = Duration::from_millis(500);

/// Per-user outcome of a guardian action.
#[derive(Debug, Clone, Serialize)]
pub struct UserGuardianResult {
    pub user_id: String,
    pub success: bool,
    pub action: &'static str,
    pub reason: String,
    pub execution_time_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_price_at_execution: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl UserGuardianResult {
    fn skipped(user_id: &str, action: GuardianAction, reason: impl Into<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            success: false,
            action: action.as_str(),
            reason: reason.into(),
            execution_time_sec: 0.0,
            market_price_at_execution: None,
            detail: None,
        }
    }
}

/// Aggregate result returned to the guardian monitor.
#[derive(Debug, Clone, Serialize)]
pub struct GuardianSummary {
    pub action: &'static str,
    pub symbol: String,
    pub total_users: usize,
    pub successful_users: usize,
    pub failed_users: usize,
    pub success_rate: f64,
    pub total_execution_time_sec: f64,
    pub results: Vec<UserGuardianResult>,
}

pub struct GuardianDispatcher {
    fleet: Arc<Fleet>,
    rules: Arc<dyn RulesRepo>,
    trades: Arc<dyn TradeRepo>,
    live_trades: Arc<dyn LiveTradeStore>,
    price_view: Arc<PriceView>,
    adjuster: Arc<StopAdjuster>,
}

impl GuardianDispatcher {
    pub fn new(
        fleet: Arc<Fleet>,
        rules: Arc<dyn RulesRepo>,
        trades: Arc<dyn TradeRepo>,
        live_trades: Arc<dyn LiveTradeStore>,
        price_view: Arc<PriceView>,
        adjuster: Arc<StopAdjuster>,
    ) -> Self {
        Self {
            fleet,
            rules,
            trades,
            live_trades,
            price_view,
            adjuster,
        }
    }

    /// Execute one guardian decision for every configured user.
    pub async fn dispatch(self: &Arc<Self>, envelope: GuardianEnvelope) -> GuardianSummary {
        let started = Instant::now();
        let symbol = envelope.symbol.to_uppercase();
        info!(
            action = envelope.action.as_str(),
            symbol = %symbol,
            users = self.fleet.len(),
            "guardian multi-user execution"
        );

        let results = match envelope.action {
            GuardianAction::Close => self.run_close_parallel(&envelope).await,
            GuardianAction::Adjust => {
                self.run_sequential(&envelope, ADJUST_SPACING).await
            }
            GuardianAction::HalfClose => {
                self.run_sequential(&envelope, HALF_CLOSE_SPACING).await
            }
        };

        let successful_users = results.iter().filter(|r| r.success).count();
        let failed_users = results.len() - successful_users;
        let total = self.fleet.len();
        let summary = GuardianSummary {
            action: envelope.action.as_str(),
            symbol,
            total_users: total,
            successful_users,
            failed_users,
            success_rate: if total > 0 {
                successful_users as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            total_execution_time_sec: started.elapsed().as_secs_f64(),
            results,
        };

        info!(
            action = summary.action,
            symbol = %summary.symbol,
            success = summary.successful_users,
            failed = summary.failed_users,
            elapsed_sec = summary.total_execution_time_sec,
            "guardian execution summary"
        );
        summary
    }

    // -------------------------------------------------------------------------
    // Concurrency strategies
    // -------------------------------------------------------------------------

    /// CLOSE races across all users. Staleness is checked once up front
    /// (time-only: a close executes even into heavy price drift).
    async fn run_close_parallel(self: &Arc<Self>, envelope: &GuardianEnvelope) -> Vec<UserGuardianResult> {
        let now_epoch = Utc::now().timestamp_millis() as f64 / 1000.0;
        if let FreshnessVerdict::Reject { reason } = freshness::validate(
            envelope,
            envelope.market_context.trigger_price,
            now_epoch,
        ) {
            warn!(reason = %reason, "close rejected before fan-out");
            return self
                .fleet
                .users
                .iter()
                .map(|u| {
                    UserGuardianResult::skipped(
                        &u.user_id,
                        envelope.action,
                        format!("validation_failed_{reason}"),
                    )
                })
                .collect();
        }

        let mut set = JoinSet::new();
        for idx in 0..self.fleet.users.len() {
            let this = self.clone();
            let env = envelope.clone();
            set.spawn(async move {
                let user = &this.fleet.users[idx];
                match timeout(CLOSE_TASK_TIMEOUT, this.execute_for_user(user, &env, None)).await {
                    Ok(result) => result,
                    Err(_) => UserGuardianResult::skipped(
                        &user.user_id,
                        env.action,
                        "close_task_timeout",
                    ),
                }
            });
        }

        let deadline = Instant::now() + CLOSE_TOTAL_TIMEOUT;
        let mut results = Vec::new();
        loop {
            match timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(result))) => results.push(result),
                Ok(Some(Err(e))) => warn!(error = %e, "close worker panicked"),
                Ok(None) => break,
                Err(_) => {
                    // Aggregate budget exhausted: late results are discarded.
                    set.abort_all();
                    let done: Vec<String> =
                        results.iter().map(|r| r.user_id.clone()).collect();
                    for user in &self.fleet.users {
                        if !done.contains(&user.user_id) {
                            results.push(UserGuardianResult::skipped(
                                &user.user_id,
                                envelope.action,
                                "parallel_execution_timeout",
                            ));
                        }
                    }
                    break;
                }
            }
        }
        results
    }

    /// ADJUST / HALF_CLOSE walk the users in order with explicit spacing;
    /// each user gets a fresh mark price and an independent verdict.
    async fn run_sequential(
        self: &Arc<Self>,
        envelope: &GuardianEnvelope,
        spacing: Duration,
    ) -> Vec<UserGuardianResult> {
        let symbol = envelope.symbol.to_uppercase();
        let mut results = Vec::with_capacity(self.fleet.len());

        for (i, user) in self.fleet.users.iter().enumerate() {
            if i > 0 {
                sleep(spacing).await;
            }

            let snapshot = match self.price_view.snapshot(user.venue.as_ref(), &symbol).await {
                Ok(s) => s,
                Err(e) => {
                    results.push(UserGuardianResult::skipped(
                        &user.user_id,
                        envelope.action,
                        format!("fresh_data_unavailable_{e}"),
                    ));
                    continue;
                }
            };
            let mark = snapshot.mark_price;

            let now_epoch = Utc::now().timestamp_millis() as f64 / 1000.0;
            let adjusted_stop = match freshness::validate(envelope, mark, now_epoch) {
                FreshnessVerdict::Reject { reason } => {
                    warn!(user_id = %user.user_id, reason = %reason, "guardian validation failed");
                    results.push(UserGuardianResult::skipped(
                        &user.user_id,
                        envelope.action,
                        format!("validation_failed_{reason}"),
                    ));
                    continue;
                }
                FreshnessVerdict::Proceed { adjusted_stop, .. } => adjusted_stop,
            };

            let mut result = self.execute_for_user(user, envelope, adjusted_stop).await;
            result.market_price_at_execution = Some(mark);
            results.push(result);
        }
        results
    }

    // -------------------------------------------------------------------------
    // Per-user execution
    // -------------------------------------------------------------------------

    async fn execute_for_user(
        &self,
        user: &UserAccount,
        envelope: &GuardianEnvelope,
        adjusted_stop: Option<f64>,
    ) -> UserGuardianResult {
        let started = Instant::now();
        let action = envelope.action;
        let symbol = envelope.symbol.to_uppercase();

        // A user without a rules row participates with the defaults
        // (guardian on, half-close off).
        let rules = match self.rules.user_rules(&user.user_id, GUARDIAN_STRATEGY) {
            Ok(Some(stored)) => stored.rules,
            Ok(None) => UserRules::default(),
            Err(e) => {
                warn!(user_id = %user.user_id, error = %e, "rules load failed, using defaults");
                UserRules::default()
            }
        };

        if !rules.use_guardian {
            return UserGuardianResult::skipped(&user.user_id, action, "guardian_disabled");
        }
        if action == GuardianAction::HalfClose && !rules.use_guardian_half {
            return UserGuardianResult::skipped(&user.user_id, action, "half_close_disabled");
        }

        let (success, reason, detail) = match action {
            GuardianAction::Close => self.close_for_user(user, &symbol).await,
            GuardianAction::Adjust => {
                let Some(stop) = adjusted_stop.or(envelope.stop) else {
                    return UserGuardianResult::skipped(&user.user_id, action, "no_stop_price");
                };
                let result = self
                    .adjuster
                    .adjust_stop(
                        user.venue.as_ref(),
                        &user.user_id,
                        &symbol,
                        stop,
                        envelope.level_metadata.as_ref(),
                    )
                    .await;
                let success = result.success;
                let reason = if success {
                    "executed_successfully".to_string()
                } else {
                    format!("execution_failed_{}", result.reason)
                };
                (success, reason, serde_json::to_value(&result).ok())
            }
            GuardianAction::HalfClose => {
                let result = self
                    .adjuster
                    .half_close_move_be(user.venue.as_ref(), &user.user_id, &symbol)
                    .await;
                let success = result.success;
                let reason = if success {
                    "executed_successfully".to_string()
                } else {
                    format!("execution_failed_{}", result.reason)
                };
                (success, reason, serde_json::to_value(&result).ok())
            }
        };

        UserGuardianResult {
            user_id: user.user_id.clone(),
            success,
            action: action.as_str(),
            reason,
            execution_time_sec: started.elapsed().as_secs_f64(),
            market_price_at_execution: None,
            detail,
        }
    }

    /// Close the whole position reduceOnly, record the exit with the PnL
    /// captured BEFORE the close (it reads zero afterwards), clean up the
    /// resting exits, and drop the shared live-trade record.
    async fn close_for_user(
        &self,
        user: &UserAccount,
        symbol: &str,
    ) -> (bool, String, Option<serde_json::Value>) {
        let venue: &dyn VenueClient = user.venue.as_ref();

        let position = match venue.positions(Some(symbol)).await {
            Ok(positions) => positions.into_iter().find(|p| p.is_open()),
            Err(e) => return (false, format!("position_read_failed_{e}"), None),
        };
        let Some(position) = position else {
            return (true, "no_position_to_close".to_string(), None);
        };

        let pnl = position.unrealized_pnl;
        let mark = self
            .price_view
            .mark_price(venue, symbol)
            .await
            .unwrap_or(position.entry_price);

        let side = if position.position_amt > 0.0 {
            Direction::Sell
        } else {
            Direction::Buy
        };
        let ack = match venue
            .create_market(symbol, side, Some(position.position_amt.abs()), true, false)
            .await
        {
            Ok(ack) => ack,
            Err(e) => return (false, format!("close_order_failed_{e}"), None),
        };

        if let Err(e) = self.trades.update_exit(
            &user.user_id,
            GUARDIAN_STRATEGY,
            symbol,
            ExitReason::GuardianClose,
            mark,
            pnl,
            Utc::now(),
        ) {
            warn!(user_id = %user.user_id, symbol, error = %e, "exit record update failed");
        }

        if let Err(e) = orphans::cancel_all_exits(venue, symbol, &user.user_id).await {
            warn!(user_id = %user.user_id, symbol, error = %e, "exit cleanup after close failed");
        }
        if let Err(e) = self.live_trades.delete(&user.user_id, symbol) {
            warn!(user_id = %user.user_id, symbol, error = %e, "live trade delete failed");
        }

        info!(user_id = %user.user_id, symbol, pnl, "position closed by guardian");
        (
            true,
            "executed_successfully".to_string(),
            Some(serde_json::json!({ "order_id": ack.order_id, "exit_price": mark, "pnl": pnl })),
        )
    }
}
