// =============================================================================
// StopAdjuster — tighten-only SL replacement and half-close to break-even
// =============================================================================
//
// adjust_stop replaces the resting stop of an open position with a tighter
// one. The stop may only move toward the mark, never away; equality is
// allowed so replaying an adjustment is a no-op. Existing stops are
// enumerated on BOTH order channels and each is cancelled through the
// channel it came from; the take-profit is never touched.
//
// After the exchange change, the shared live-trade record is synced. A
// failed sync is retried once after 500 ms; if it still fails the exchange
// change stands and the result carries `cache_updated=false` — the cache is
// advisory, the venue is the source of truth.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::market::{PriceView, SpecCache};
use crate::store::live_trade::LiveTradeStore;
use crate::types::Direction;
use crate::venue::{ConditionalKind, OpenOrder, OrderChannel, VenueClient, WorkingType};

use super::orphans;
use super::rounding::round_down_to_increment;

const CACHE_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_LEVEL_NAME: &str = "manual_adjust";

/// Trailing-stop level metadata attached to a guardian adjust action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_threshold_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_level: Option<String>,
}

/// Outcome of an adjust_stop call.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustResult {
    pub success: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_stop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_applied: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_updated: Option<bool>,
}

impl AdjustResult {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
            direction: None,
            stop: None,
            previous_stop: None,
            level_applied: None,
            cache_updated: None,
        }
    }
}

/// Outcome of a half-close call.
#[derive(Debug, Clone, Serialize)]
pub struct HalfCloseResult {
    pub success: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_close_order_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_stop: Option<f64>,
    pub fully_closed: bool,
}

pub struct StopAdjuster {
    spec_cache: Arc<SpecCache>,
    price_view: Arc<PriceView>,
    live_trades: Arc<dyn LiveTradeStore>,
}

impl StopAdjuster {
    pub fn new(
        spec_cache: Arc<SpecCache>,
        price_view: Arc<PriceView>,
        live_trades: Arc<dyn LiveTradeStore>,
    ) -> Self {
        Self {
            spec_cache,
            price_view,
            live_trades,
        }
    }

    /// Replace the stop of the open position on `symbol` with `new_stop`.
    pub async fn adjust_stop(
        &self,
        venue: &dyn VenueClient,
        user_id: &str,
        symbol: &str,
        new_stop: f64,
        level_metadata: Option<&LevelMetadata>,
    ) -> AdjustResult {
        let symbol = symbol.to_uppercase();

        // ── 0. Position required ────────────────────────────────────────
        let position_amt = match venue.positions(Some(&symbol)).await {
            Ok(positions) => positions
                .iter()
                .find(|p| p.is_open())
                .map(|p| p.position_amt),
            Err(e) => return AdjustResult::failed(e.to_string()),
        };
        let Some(position_amt) = position_amt else {
            return AdjustResult::failed("no_open_position_to_adjust");
        };

        let direction = if position_amt > 0.0 {
            Direction::Buy
        } else {
            Direction::Sell
        };
        let exit_side = direction.opposite();

        // ── 1. Normalize to tick and bounds-check ───────────────────────
        let filters = match self.spec_cache.symbol_filters(venue, &symbol).await {
            Ok(f) => f,
            Err(e) => return AdjustResult::failed(e.to_string()),
        };
        let new_stop = round_down_to_increment(new_stop, filters.tick_size);
        if new_stop < filters.min_price || new_stop > filters.max_price {
            return AdjustResult::failed(format!("stop_{new_stop}_outside_price_filter"));
        }

        // ── 2. Find the current stop on both channels ───────────────────
        let stop_orders = match self.collect_stop_orders(venue, &symbol).await {
            Ok(orders) => orders,
            Err(e) => return AdjustResult::failed(e.to_string()),
        };
        let current_stop = stop_orders.iter().find_map(|o| o.trigger_price);

        // ── 3. Tighten-only ─────────────────────────────────────────────
        if let Some(current) = current_stop {
            let looser = match direction {
                Direction::Buy => new_stop < current,
                Direction::Sell => new_stop > current,
            };
            if looser {
                return AdjustResult::failed(format!(
                    "looser_stop_not_allowed(current {current}, new {new_stop})"
                ));
            }
        }

        // ── 4. Side sanity against the mark ─────────────────────────────
        let mark = match self.price_view.mark_price(venue, &symbol).await {
            Ok(m) => m,
            Err(e) => return AdjustResult::failed(e.to_string()),
        };
        match direction {
            Direction::Buy if new_stop >= mark => {
                return AdjustResult::failed("invalid_sl_for_long(expected new_stop < mark)");
            }
            Direction::Sell if new_stop <= mark => {
                return AdjustResult::failed("invalid_sl_for_short(expected new_stop > mark)");
            }
            _ => {}
        }

        // ── 5. Replace the stop, leaving the TP untouched ───────────────
        for order in &stop_orders {
            let result = match order.channel {
                OrderChannel::Classic => venue.cancel_order(&symbol, order.id).await,
                OrderChannel::Algo => venue.cancel_conditional(&symbol, order.id).await,
            };
            if let Err(e) = result {
                warn!(symbol = %symbol, order_id = order.id, error = %e, "could not cancel stop order");
            }
        }

        if let Err(e) = venue
            .create_conditional(
                &symbol,
                exit_side,
                ConditionalKind::StopMarket,
                new_stop,
                WorkingType::ContractPrice,
            )
            .await
        {
            return AdjustResult::failed(format!("failed_to_create_new_stop: {e}"));
        }

        // ── 6. Sync the shared live-trade record ────────────────────────
        let level_name = level_metadata
            .and_then(|m| m.level_name.clone())
            .unwrap_or_else(|| DEFAULT_LEVEL_NAME.to_string());
        let cache_updated = self
            .sync_live_trade(user_id, &symbol, new_stop, current_stop, &level_name, level_metadata)
            .await;

        info!(
            symbol = %symbol,
            user_id,
            new_stop,
            previous_stop = ?current_stop,
            level = %level_name,
            cache_updated,
            "stop adjusted"
        );

        AdjustResult {
            success: true,
            reason: "stop_adjusted".to_string(),
            direction: Some(direction),
            stop: Some(new_stop),
            previous_stop: current_stop,
            level_applied: Some(level_name),
            cache_updated: Some(cache_updated),
        }
    }

    /// Close half the position reduceOnly, then move the remaining stop to
    /// break-even.
    pub async fn half_close_move_be(
        &self,
        venue: &dyn VenueClient,
        user_id: &str,
        symbol: &str,
    ) -> HalfCloseResult {
        let symbol = symbol.to_uppercase();

        // ── Read the position ───────────────────────────────────────────
        let position = match venue.positions(Some(&symbol)).await {
            Ok(positions) => positions.into_iter().find(|p| p.is_open()),
            Err(e) => return Self::half_failed(e.to_string()),
        };
        let Some(position) = position else {
            return Self::half_failed("no_open_position_to_half_close");
        };
        if position.entry_price <= 0.0 {
            return Self::half_failed("invalid_entry_price_for_be");
        }

        // ── Half quantity on the lot step ───────────────────────────────
        let filters = match self.spec_cache.symbol_filters(venue, &symbol).await {
            Ok(f) => f,
            Err(e) => return Self::half_failed(e.to_string()),
        };
        let mark = match self.price_view.mark_price(venue, &symbol).await {
            Ok(m) => m,
            Err(e) => return Self::half_failed(e.to_string()),
        };

        let qty_half =
            round_down_to_increment(position.position_amt.abs() * 0.5, filters.step_size);
        if qty_half < filters.min_qty || qty_half * mark < filters.min_notional {
            return Self::half_failed(format!("half_qty_invalid_after_step_size:{qty_half}"));
        }

        // ── Close half reduceOnly ───────────────────────────────────────
        let reduce_side = if position.position_amt > 0.0 {
            Direction::Sell
        } else {
            Direction::Buy
        };
        let ack = match venue
            .create_market(&symbol, reduce_side, Some(qty_half), true, false)
            .await
        {
            Ok(ack) => ack,
            Err(e) => return Self::half_failed(format!("half_close_order_failed: {e}")),
        };

        // ── Re-read the remaining position ──────────────────────────────
        let remaining = match venue.positions(Some(&symbol)).await {
            Ok(positions) => positions.into_iter().find(|p| p.is_open()),
            Err(e) => return Self::half_failed(e.to_string()),
        };
        let Some(remaining) = remaining else {
            // Rounding closed everything: clean up the resting exits.
            if let Err(e) = orphans::cancel_all_exits(venue, &symbol, user_id).await {
                warn!(symbol = %symbol, user_id, error = %e, "straggler cleanup failed");
            }
            info!(symbol = %symbol, user_id, "half-close fully closed the position");
            return HalfCloseResult {
                success: true,
                reason: "half_close_done_position_fully_closed".to_string(),
                half_close_order_id: Some(ack.order_id),
                new_stop: None,
                fully_closed: true,
            };
        };

        // ── Break-even price for the remainder ──────────────────────────
        // The venue may recompute entryPrice after the partial close; use
        // the updated value. If BE sits on the wrong side of the mark,
        // shift one tick toward the profitable side so the conditional is
        // acceptable.
        let be_raw = if remaining.entry_price > 0.0 {
            remaining.entry_price
        } else {
            position.entry_price
        };
        let tick = filters.tick_size;
        let mut be_price = round_down_to_increment(be_raw, tick);
        if remaining.position_amt > 0.0 && be_price >= mark {
            be_price = round_down_to_increment(mark, tick) - tick;
        } else if remaining.position_amt < 0.0 && be_price <= mark {
            be_price = round_down_to_increment(mark, tick) + tick;
        }

        // ── Tighten-only move to BE ─────────────────────────────────────
        let adjust = self
            .adjust_stop(venue, user_id, &symbol, be_price, None)
            .await;
        if !adjust.success {
            // Not fatal: the existing SL may already be tighter than BE.
            debug!(symbol = %symbol, reason = %adjust.reason, "BE stop left unchanged");
            return HalfCloseResult {
                success: true,
                reason: "half_close_done_be_stop_unchanged".to_string(),
                half_close_order_id: Some(ack.order_id),
                new_stop: None,
                fully_closed: false,
            };
        }

        HalfCloseResult {
            success: true,
            reason: "half_close_done_sl_moved_to_be".to_string(),
            half_close_order_id: Some(ack.order_id),
            new_stop: adjust.stop,
            fully_closed: false,
        }
    }

    fn half_failed(reason: impl Into<String>) -> HalfCloseResult {
        HalfCloseResult {
            success: false,
            reason: reason.into(),
            half_close_order_id: None,
            new_stop: None,
            fully_closed: false,
        }
    }

    async fn collect_stop_orders(
        &self,
        venue: &dyn VenueClient,
        symbol: &str,
    ) -> crate::venue::VenueResult<Vec<OpenOrder>> {
        let mut orders = venue.open_orders(symbol).await?;
        match venue.open_conditional_orders(symbol).await {
            Ok(mut conditional) => orders.append(&mut conditional),
            Err(e) => warn!(symbol, error = %e, "conditional order listing failed"),
        }
        orders.retain(|o| o.is_stop());
        Ok(orders)
    }

    /// Read-modify-write of the shared live-trade record, retried once.
    /// `original_stop` is preserved when present and otherwise set to the
    /// stop being replaced, so it is written exactly once over the trade's
    /// lifetime.
    async fn sync_live_trade(
        &self,
        user_id: &str,
        symbol: &str,
        new_stop: f64,
        previous_stop: Option<f64>,
        level_name: &str,
        level_metadata: Option<&LevelMetadata>,
    ) -> bool {
        for attempt in 0..2 {
            if attempt > 0 {
                sleep(CACHE_RETRY_DELAY).await;
            }

            let result = self.live_trades.get(user_id, symbol).and_then(|existing| {
                let Some(mut trade) = existing else {
                    warn!(user_id, symbol, "live trade not found in cache, skipping sync");
                    return Ok(false);
                };

                let previous_level_from_cache = trade.ts_level_applied.clone();

                if trade.original_stop.is_none() {
                    trade.original_stop = Some(previous_stop.unwrap_or(new_stop));
                }
                trade.stop = new_stop;
                trade.stop_loss = new_stop;
                trade.ts_level_applied = Some(level_name.to_string());
                trade.ts_last_adjustment_ts = Some(Utc::now());
                trade.ts_last_adjustment_stop = Some(new_stop);
                trade.ts_previous_stop = Some(previous_stop.unwrap_or(new_stop));
                trade.ts_previous_level = level_metadata
                    .and_then(|m| m.previous_level.clone())
                    .or(previous_level_from_cache);

                self.live_trades.put(user_id, symbol, &trade)?;
                Ok(true)
            });

            match result {
                Ok(updated) => return updated,
                Err(e) if attempt == 0 => {
                    warn!(user_id, symbol, error = %e, "live trade sync failed, retrying once");
                }
                Err(e) => {
                    // The venue change stands; the cache is out of sync.
                    error!(
                        user_id,
                        symbol,
                        error = %e,
                        "live trade sync failed after retry, manual verification recommended"
                    );
                }
            }
        }
        false
    }
}
