// =============================================================================
// PositionGuard — atomic entry + stop-loss + take-profit installation
// =============================================================================
//
// The critical section: MARKET entry → wait for FILL → STOP_MARKET →
// TAKE_PROFIT_MARKET. Once the entry fills, every failure path must run
// through Emergency Flatten so a naked position never survives the request.
// The caller always learns which phase failed and whether the position is
// confirmed closed.
//
// Emergency Flatten:
//   1. Up to 5 closePosition=true MARKET attempts (backoff 2, 4, 8, 10, 10 s),
//      each verified by a position query.
//   2. Fallback: 2 reduceOnly attempts with explicit quantity.
//   3. Still open → CRITICAL log with (user, symbol, direction, quantity).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::market::{PriceView, SpecCache};
use crate::rules::UserRules;
use crate::store::live_trade::{LiveTrade, LiveTradeStore};
use crate::store::TradeRepo;
use crate::types::{Direction, ExitReason, OrderIds, Signal, TradeRecord};
use crate::venue::{ConditionalKind, OrderStatus, VenueClient, WorkingType};

use super::orphans;
use super::reprice::{reprice_to_mark, size_position};

const FILL_POLL_ATTEMPTS: u32 = 3;
const FILL_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FLATTEN_ATTEMPTS: u32 = 5;
const FLATTEN_FALLBACK_ATTEMPTS: u32 = 2;
const FLATTEN_VERIFY_DELAY: Duration = Duration::from_secs(1);
const FLATTEN_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Which phase of the open-trade protocol produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecStep {
    #[serde(rename = "VALIDATION")]
    Validation,
    #[serde(rename = "MARKET_ORDER")]
    MarketOrder,
    #[serde(rename = "WAIT_FILL_TIMEOUT")]
    WaitFillTimeout,
    #[serde(rename = "STOP_LOSS")]
    StopLoss,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
    #[serde(rename = "EXCEPTION")]
    Exception,
    #[serde(rename = "ALL_OK")]
    AllOk,
}

/// Outcome of one `open_trade` call, returned inline per user.
#[derive(Debug, Clone, Serialize)]
pub struct OpenResult {
    pub success: bool,
    pub step: ExecStep,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl_order_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp_order_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capital_risked: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_closed: Option<bool>,
}

impl OpenResult {
    pub(crate) fn rejected(step: ExecStep, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            step,
            reason: reason.into(),
            order_id: None,
            sl_order_id: None,
            tp_order_id: None,
            entry: None,
            stop_loss: None,
            target: None,
            quantity: None,
            leverage: None,
            rr: None,
            capital_risked: None,
            position_closed: None,
        }
    }
}

/// Atomic trade-triplet executor shared across the user fleet.
pub struct PositionGuard {
    spec_cache: Arc<SpecCache>,
    price_view: Arc<PriceView>,
    trades: Arc<dyn TradeRepo>,
    live_trades: Arc<dyn LiveTradeStore>,
    /// Last leverage applied per (user, symbol); skips redundant venue calls.
    applied_leverage: RwLock<HashMap<(String, String), u32>>,
}

impl PositionGuard {
    pub fn new(
        spec_cache: Arc<SpecCache>,
        price_view: Arc<PriceView>,
        trades: Arc<dyn TradeRepo>,
        live_trades: Arc<dyn LiveTradeStore>,
    ) -> Self {
        Self {
            spec_cache,
            price_view,
            trades,
            live_trades,
            applied_leverage: RwLock::new(HashMap::new()),
        }
    }

    /// Open an entry + SL + TP triplet for one user. The signal has already
    /// passed the rule engine.
    pub async fn open_trade(
        &self,
        venue: &dyn VenueClient,
        user_id: &str,
        rules: &UserRules,
        signal: &Signal,
    ) -> OpenResult {
        let symbol = signal.symbol.to_uppercase();
        info!(symbol = %symbol, user_id, direction = %signal.direction, "opening trade");

        // ── 1. Pre-flight: clear orphaned exit orders ───────────────────
        if let Err(e) = orphans::cancel_orphan_exits(venue, &symbol, user_id).await {
            warn!(symbol = %symbol, user_id, error = %e, "orphan cleanup failed, continuing");
        }

        // ── 2. Symbol filters ───────────────────────────────────────────
        let filters = match self.spec_cache.symbol_filters(venue, &symbol).await {
            Ok(f) if f.is_valid() => f,
            Ok(_) => return OpenResult::rejected(ExecStep::Validation, "invalid_symbol_filters"),
            Err(e) => return OpenResult::rejected(ExecStep::Validation, e.to_string()),
        };

        // ── 3. Reprice against the current mark ─────────────────────────
        let mark = match self.price_view.mark_price(venue, &symbol).await {
            Ok(m) if m > 0.0 => m,
            Ok(_) => return OpenResult::rejected(ExecStep::Validation, "mark_price_unavailable"),
            Err(e) => return OpenResult::rejected(ExecStep::Validation, e.to_string()),
        };

        let levels = reprice_to_mark(
            signal.direction,
            signal.entry,
            signal.stop,
            signal.rr,
            mark,
            filters.tick_size,
        );
        debug!(
            symbol = %symbol,
            entry = levels.entry,
            stop = levels.stop,
            target = levels.target,
            realized_rr = levels.realized_rr,
            "signal repriced to mark"
        );

        if levels.realized_rr < rules.min_rr {
            return OpenResult::rejected(
                ExecStep::Validation,
                format!("repriced_rr:{:.2}<{}", levels.realized_rr, rules.min_rr),
            );
        }

        // ── 4. Size the position ────────────────────────────────────────
        let balance = match venue.account_usdt_free().await {
            Ok(b) => b,
            Err(e) => return OpenResult::rejected(ExecStep::Validation, e.to_string()),
        };
        let sized = match size_position(
            balance,
            rules.risk_pct,
            levels.entry,
            levels.stop,
            &filters,
        ) {
            Ok(s) => s,
            Err(detail) => return OpenResult::rejected(ExecStep::Validation, detail),
        };

        // ── 5. Leverage ─────────────────────────────────────────────────
        let bracket = match self.spec_cache.max_leverage(venue, &symbol).await {
            Ok(l) => l,
            Err(e) => return OpenResult::rejected(ExecStep::Validation, e.to_string()),
        };
        let leverage = rules.max_leverage.min(bracket).max(1);

        let leverage_key = (user_id.to_string(), symbol.clone());
        let already_applied =
            self.applied_leverage.read().get(&leverage_key).copied() == Some(leverage);
        if !already_applied {
            if let Err(e) = venue.set_leverage(&symbol, leverage).await {
                return OpenResult::rejected(
                    ExecStep::Validation,
                    format!("set_leverage_failed: {e}"),
                );
            }
            self.applied_leverage.write().insert(leverage_key, leverage);
        }

        // ── 6. Critical section ─────────────────────────────────────────
        let mut result = self
            .execute_triplet(venue, user_id, signal.direction, &symbol, &levels, sized.quantity)
            .await;
        result.leverage = Some(leverage);
        result.capital_risked = Some(sized.capital_risked);
        result.rr = Some(levels.realized_rr);

        // ── 7. Persist & publish ────────────────────────────────────────
        if result.success {
            let record = TradeRecord {
                symbol: symbol.clone(),
                user_id: user_id.to_string(),
                strategy: signal.strategy.clone(),
                direction: signal.direction,
                order_ids: OrderIds {
                    entry: result.order_id,
                    sl: result.sl_order_id,
                    tp: result.tp_order_id,
                },
                entry_price: levels.entry,
                stop_loss: levels.stop,
                take_profit: levels.target,
                quantity: sized.quantity,
                rr: levels.realized_rr,
                leverage,
                capital_risked: sized.capital_risked,
                probability: signal.probability,
                ev: signal.ev,
                grok: signal.grok.clone(),
                rules_snapshot: serde_json::to_value(rules).unwrap_or_default(),
                signal_timestamp: signal.timestamp,
                created_at: Utc::now(),
                exit_reason: ExitReason::Active,
                exit_time: None,
                exit_price: None,
                pnl: None,
            };
            if let Err(e) = self.trades.record_open(&record) {
                error!(symbol = %symbol, user_id, error = %e, "trade record persist failed");
            }

            let live = LiveTrade::opened(levels.entry, levels.stop, levels.target);
            if let Err(e) = self.live_trades.put(user_id, &symbol, &live) {
                error!(symbol = %symbol, user_id, error = %e, "live trade publish failed");
            }

            info!(
                symbol = %symbol,
                user_id,
                order_id = ?result.order_id,
                quantity = sized.quantity,
                "trade opened with SL and TP installed"
            );
        }

        result
    }

    /// MARKET → FILL → SL → TP with the no-naked-position guarantee.
    async fn execute_triplet(
        &self,
        venue: &dyn VenueClient,
        user_id: &str,
        direction: Direction,
        symbol: &str,
        levels: &super::reprice::RepricedLevels,
        quantity: f64,
    ) -> OpenResult {
        // ── a. MARKET entry ─────────────────────────────────────────────
        let entry_ack = match venue
            .create_market(symbol, direction, Some(quantity), false, false)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                warn!(symbol, user_id, error = %e, "market entry failed");
                return OpenResult::rejected(ExecStep::MarketOrder, e.to_string());
            }
        };
        let order_id = entry_ack.order_id;

        // ── b. Wait for FILL ────────────────────────────────────────────
        let mut filled = false;
        for attempt in 1..=FILL_POLL_ATTEMPTS {
            match venue.get_order(symbol, order_id).await {
                Ok(OrderStatus::Filled) => {
                    debug!(symbol, order_id, "market entry FILLED");
                    filled = true;
                    break;
                }
                Ok(status) => {
                    debug!(symbol, order_id, ?status, attempt, "entry not filled yet");
                }
                // A failed status read is treated as not-filled: the
                // timeout safety path below re-checks the real position.
                Err(e) => warn!(symbol, order_id, error = %e, "order status read failed"),
            }
            sleep(FILL_POLL_INTERVAL).await;
        }

        if !filled {
            warn!(symbol, user_id, order_id, "timeout waiting for FILLED, checking position");
            let amt = self.position_amount(venue, symbol).await;

            if amt != 0.0 {
                // The order (partially) filled without confirmation: the
                // position must not stay naked.
                error!(symbol, user_id, amt, "unconfirmed fill detected, flattening");
                let closed = self
                    .emergency_flatten(venue, user_id, symbol, direction, amt.abs())
                    .await;
                let mut r = OpenResult::rejected(
                    ExecStep::WaitFillTimeout,
                    if closed {
                        "fill timeout, position flattened"
                    } else {
                        "fill timeout, FLATTEN FAILED"
                    },
                );
                r.order_id = Some(order_id);
                r.position_closed = Some(closed);
                return r;
            }

            let mut r = OpenResult::rejected(
                ExecStep::WaitFillTimeout,
                "fill timeout, no position detected",
            );
            r.order_id = Some(order_id);
            r.position_closed = Some(false);
            return r;
        }

        // ── c. Stop loss (contract price triggers faster in a crash) ───
        let exit_side = direction.opposite();
        let sl_ack = match venue
            .create_conditional(
                symbol,
                exit_side,
                ConditionalKind::StopMarket,
                levels.stop,
                WorkingType::ContractPrice,
            )
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!(symbol, user_id, error = %e, "SL creation failed, flattening position");
                let closed = self
                    .emergency_flatten(venue, user_id, symbol, direction, quantity)
                    .await;
                let mut r = OpenResult::rejected(
                    ExecStep::StopLoss,
                    if closed {
                        format!("SL failed ({e}), position closed")
                    } else {
                        format!("SL failed ({e}), FLATTEN FAILED")
                    },
                );
                r.order_id = Some(order_id);
                r.position_closed = Some(closed);
                return r;
            }
        };

        // ── d. Take profit (mark price avoids wick executions) ──────────
        let tp_ack = match venue
            .create_conditional(
                symbol,
                exit_side,
                ConditionalKind::TakeProfitMarket,
                levels.target,
                WorkingType::MarkPrice,
            )
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!(symbol, user_id, error = %e, "TP creation failed, flattening position");
                let closed = self
                    .emergency_flatten(venue, user_id, symbol, direction, quantity)
                    .await;
                let mut r = OpenResult::rejected(
                    ExecStep::TakeProfit,
                    if closed {
                        format!("TP failed ({e}), position closed")
                    } else {
                        format!("TP failed ({e}), FLATTEN FAILED")
                    },
                );
                r.order_id = Some(order_id);
                r.sl_order_id = Some(sl_ack.order_id);
                r.position_closed = Some(closed);
                return r;
            }
        };

        OpenResult {
            success: true,
            step: ExecStep::AllOk,
            reason: "ALL_OK".to_string(),
            order_id: Some(order_id),
            sl_order_id: Some(sl_ack.order_id),
            tp_order_id: Some(tp_ack.order_id),
            entry: Some(levels.entry),
            stop_loss: Some(levels.stop),
            target: Some(levels.target),
            quantity: Some(quantity),
            leverage: None,
            rr: None,
            capital_risked: None,
            position_closed: None,
        }
    }

    async fn position_amount(&self, venue: &dyn VenueClient, symbol: &str) -> f64 {
        match venue.positions(Some(symbol)).await {
            Ok(positions) => positions.first().map(|p| p.position_amt).unwrap_or(0.0),
            Err(e) => {
                warn!(symbol, error = %e, "position read failed");
                0.0
            }
        }
    }

    /// Forcibly close a filled position. Returns whether the position is
    /// confirmed flat.
    pub async fn emergency_flatten(
        &self,
        venue: &dyn VenueClient,
        user_id: &str,
        symbol: &str,
        direction: Direction,
        quantity: f64,
    ) -> bool {
        let close_side = direction.opposite();
        warn!(symbol, user_id, "EMERGENCY: flattening position");

        // Strategy 1: closePosition=true lets the venue close everything.
        for attempt in 1..=FLATTEN_ATTEMPTS {
            match venue.create_market(symbol, close_side, None, false, true).await {
                Ok(_) => {
                    sleep(FLATTEN_VERIFY_DELAY).await;
                    if self.position_amount(venue, symbol).await == 0.0 {
                        info!(symbol, user_id, attempt, "position flattened");
                        if let Err(e) = orphans::cancel_all_exits(venue, symbol, user_id).await {
                            warn!(symbol, user_id, error = %e, "exit cleanup after flatten failed");
                        }
                        return true;
                    }
                    warn!(symbol, user_id, attempt, "position still open after close order");
                }
                Err(e) => {
                    error!(symbol, user_id, attempt, error = %e, "flatten attempt failed");
                    if attempt < FLATTEN_ATTEMPTS {
                        let backoff = Duration::from_secs(1 << attempt).min(FLATTEN_MAX_BACKOFF);
                        sleep(backoff).await;
                    }
                }
            }
        }

        // Strategy 2: reduceOnly with the explicit quantity.
        warn!(symbol, user_id, quantity, "flatten fallback: reduceOnly with quantity");
        for attempt in 1..=FLATTEN_FALLBACK_ATTEMPTS {
            match venue
                .create_market(symbol, close_side, Some(quantity), true, false)
                .await
            {
                Ok(_) => {
                    sleep(FLATTEN_VERIFY_DELAY).await;
                    if self.position_amount(venue, symbol).await == 0.0 {
                        info!(symbol, user_id, "position flattened via reduceOnly");
                        if let Err(e) = orphans::cancel_all_exits(venue, symbol, user_id).await {
                            warn!(symbol, user_id, error = %e, "exit cleanup after flatten failed");
                        }
                        return true;
                    }
                }
                Err(e) => {
                    error!(symbol, user_id, attempt, error = %e, "reduceOnly attempt failed");
                    if attempt < FLATTEN_FALLBACK_ATTEMPTS {
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }

        // The only fatal-but-recoverable state the system emits. An
        // out-of-band log route alerts on this marker.
        error!(
            symbol,
            user_id,
            direction = %direction,
            quantity,
            "CRITICAL: POSITION COULD NOT BE CLOSED - manual action required, position has no SL/TP"
        );
        false
    }
}
