// =============================================================================
// Scripted venue for tests
// =============================================================================
//
// Implements the full `VenueClient` trait against in-memory state with
// failure-injection knobs, so executor and dispatcher tests can drive the
// exact scenarios the invariants require (SL failure → flatten, fill
// timeout, tighten-only rejection, ...). Every call is counted so tests can
// assert that rejected validations never reach the venue.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::VenueError;
use crate::types::Direction;

use super::{
    ConditionalKind, ExchangeInfo, OpenOrder, OrderAck, OrderBook, OrderChannel, OrderStatus,
    PositionInfo, SymbolFilters, VenueClient, VenueResult, WorkingType,
};

/// A recorded MARKET submission.
#[derive(Debug, Clone)]
pub struct MarketCall {
    pub symbol: String,
    pub side: Direction,
    pub quantity: Option<f64>,
    pub reduce_only: bool,
    pub close_position: bool,
}

/// A recorded conditional submission.
#[derive(Debug, Clone)]
pub struct ConditionalCall {
    pub symbol: String,
    pub side: Direction,
    pub kind: ConditionalKind,
    pub trigger_price: f64,
    pub working_type: WorkingType,
    pub id: u64,
}

pub struct MockVenue {
    pub symbol: String,
    pub filters: Mutex<SymbolFilters>,
    pub mark: Mutex<f64>,
    pub balance: Mutex<f64>,
    pub bracket_leverage: Mutex<u32>,
    pub positions: Mutex<Vec<PositionInfo>>,
    pub classic_orders: Mutex<Vec<OpenOrder>>,
    pub algo_orders: Mutex<Vec<OpenOrder>>,
    pub entry_order_status: Mutex<OrderStatus>,

    // ── Failure injection ───────────────────────────────────────────────
    /// Fail the next N mark-price calls with the given error.
    pub fail_mark_price: Mutex<Option<(Arc<AtomicU32>, VenueError)>>,
    /// Fail plain (entry) MARKET orders.
    pub fail_entry_market: Mutex<Option<VenueError>>,
    /// Fail closePosition MARKET orders.
    pub fail_close_market: Mutex<Option<VenueError>>,
    /// Fail reduceOnly MARKET orders.
    pub fail_reduce_only: Mutex<Option<VenueError>>,
    /// Fail STOP_MARKET conditional creation.
    pub fail_stop_order: Mutex<Option<VenueError>>,
    /// Fail TAKE_PROFIT_MARKET conditional creation.
    pub fail_take_profit_order: Mutex<Option<VenueError>>,
    /// Fail position queries.
    pub fail_positions: Mutex<Option<VenueError>>,
    /// Fail exchange-info fetches.
    pub fail_exchange_info: Mutex<Option<VenueError>>,
    /// Fail leverage-bracket fetches.
    pub fail_leverage_bracket: Mutex<Option<VenueError>>,

    /// When set, a successful entry MARKET installs a position with this
    /// signed amount at the current mark (simulates the venue fill).
    pub position_after_entry: Mutex<Option<f64>>,
    /// When set, a reduceOnly MARKET removes the whole position (simulates
    /// the venue absorbing a dust remainder).
    pub reduce_closes_fully: Mutex<bool>,

    // ── Recordings ──────────────────────────────────────────────────────
    pub market_calls: Mutex<Vec<MarketCall>>,
    pub conditional_calls: Mutex<Vec<ConditionalCall>>,
    pub cancelled_classic: Mutex<Vec<u64>>,
    pub cancelled_algo: Mutex<Vec<u64>>,
    pub leverage_set: Mutex<Option<u32>>,
    pub total_calls: AtomicU32,

    next_id: AtomicU64,
}

impl MockVenue {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            filters: Mutex::new(SymbolFilters {
                tick_size: 0.1,
                step_size: 0.001,
                min_qty: 0.001,
                min_notional: 5.0,
                min_price: 0.1,
                max_price: 1_000_000.0,
            }),
            mark: Mutex::new(0.0),
            balance: Mutex::new(10_000.0),
            bracket_leverage: Mutex::new(125),
            positions: Mutex::new(Vec::new()),
            classic_orders: Mutex::new(Vec::new()),
            algo_orders: Mutex::new(Vec::new()),
            entry_order_status: Mutex::new(OrderStatus::Filled),
            fail_mark_price: Mutex::new(None),
            fail_entry_market: Mutex::new(None),
            fail_close_market: Mutex::new(None),
            fail_reduce_only: Mutex::new(None),
            fail_stop_order: Mutex::new(None),
            fail_take_profit_order: Mutex::new(None),
            fail_positions: Mutex::new(None),
            fail_exchange_info: Mutex::new(None),
            fail_leverage_bracket: Mutex::new(None),
            position_after_entry: Mutex::new(None),
            reduce_closes_fully: Mutex::new(false),
            market_calls: Mutex::new(Vec::new()),
            conditional_calls: Mutex::new(Vec::new()),
            cancelled_classic: Mutex::new(Vec::new()),
            cancelled_algo: Mutex::new(Vec::new()),
            leverage_set: Mutex::new(None),
            total_calls: AtomicU32::new(0),
            next_id: AtomicU64::new(1000),
        }
    }

    /// Install an open position directly (for adjuster / guardian tests).
    pub fn set_position(&self, amt: f64, entry_price: f64, unrealized_pnl: f64) {
        *self.positions.lock() = vec![PositionInfo {
            symbol: self.symbol.clone(),
            position_amt: amt,
            entry_price,
            unrealized_pnl,
        }];
    }

    /// Install a resting stop order on the algo channel.
    pub fn set_algo_stop(&self, trigger_price: f64) -> u64 {
        let id = self.next_order_id();
        self.algo_orders.lock().push(OpenOrder {
            id,
            order_type: "STOP_MARKET".to_string(),
            trigger_price: Some(trigger_price),
            channel: OrderChannel::Algo,
        });
        id
    }

    /// Install a resting take-profit on the algo channel.
    pub fn set_algo_take_profit(&self, trigger_price: f64) -> u64 {
        let id = self.next_order_id();
        self.algo_orders.lock().push(OpenOrder {
            id,
            order_type: "TAKE_PROFIT_MARKET".to_string(),
            trigger_price: Some(trigger_price),
            channel: OrderChannel::Algo,
        });
        id
    }

    /// Install a resting stop order on the legacy channel.
    pub fn set_classic_stop(&self, trigger_price: f64) -> u64 {
        let id = self.next_order_id();
        self.classic_orders.lock().push(OpenOrder {
            id,
            order_type: "STOP_MARKET".to_string(),
            trigger_price: Some(trigger_price),
            channel: OrderChannel::Classic,
        });
        id
    }

    fn next_order_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn tick(&self) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VenueClient for MockVenue {
    async fn mark_price(&self, _symbol: &str) -> VenueResult<f64> {
        self.tick();
        if let Some((remaining, err)) = self.fail_mark_price.lock().as_ref() {
            if remaining.load(Ordering::SeqCst) > 0 {
                remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(err.clone());
            }
        }
        Ok(*self.mark.lock())
    }

    async fn order_book(&self, _symbol: &str, _depth: u32) -> VenueResult<OrderBook> {
        self.tick();
        let mark = *self.mark.lock();
        let tick = self.filters.lock().tick_size;
        Ok(OrderBook {
            bids: vec![(mark - tick, 1.0)],
            asks: vec![(mark + tick, 1.0)],
        })
    }

    async fn exchange_info(&self) -> VenueResult<ExchangeInfo> {
        self.tick();
        if let Some(err) = self.fail_exchange_info.lock().as_ref() {
            return Err(err.clone());
        }
        let mut symbols = HashMap::new();
        symbols.insert(self.symbol.clone(), *self.filters.lock());
        Ok(ExchangeInfo { symbols })
    }

    async fn leverage_bracket(&self, _symbol: &str) -> VenueResult<u32> {
        self.tick();
        if let Some(err) = self.fail_leverage_bracket.lock().as_ref() {
            return Err(err.clone());
        }
        Ok(*self.bracket_leverage.lock())
    }

    async fn account_usdt_free(&self) -> VenueResult<f64> {
        self.tick();
        Ok(*self.balance.lock())
    }

    async fn positions(&self, symbol: Option<&str>) -> VenueResult<Vec<PositionInfo>> {
        self.tick();
        if let Some(err) = self.fail_positions.lock().as_ref() {
            return Err(err.clone());
        }
        let positions = self.positions.lock().clone();
        Ok(match symbol {
            Some(s) => positions.into_iter().filter(|p| p.symbol == s).collect(),
            None => positions,
        })
    }

    async fn open_orders(&self, _symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        self.tick();
        Ok(self.classic_orders.lock().clone())
    }

    async fn open_conditional_orders(&self, _symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        self.tick();
        Ok(self.algo_orders.lock().clone())
    }

    async fn create_market(
        &self,
        symbol: &str,
        side: Direction,
        quantity: Option<f64>,
        reduce_only: bool,
        close_position: bool,
    ) -> VenueResult<OrderAck> {
        self.tick();
        self.market_calls.lock().push(MarketCall {
            symbol: symbol.to_string(),
            side,
            quantity,
            reduce_only,
            close_position,
        });

        if close_position || reduce_only {
            let gate = if close_position {
                &self.fail_close_market
            } else {
                &self.fail_reduce_only
            };
            if let Some(err) = gate.lock().as_ref() {
                return Err(err.clone());
            }
            let mut positions = self.positions.lock();
            if close_position || *self.reduce_closes_fully.lock() {
                positions.retain(|p| p.symbol != symbol);
            } else if let Some(qty) = quantity {
                for p in positions.iter_mut().filter(|p| p.symbol == symbol) {
                    let sign = if p.position_amt >= 0.0 { 1.0 } else { -1.0 };
                    p.position_amt -= sign * qty;
                    if p.position_amt.abs() < 1e-12 {
                        p.position_amt = 0.0;
                    }
                }
                positions.retain(|p| p.position_amt != 0.0);
            }
        } else {
            if let Some(err) = self.fail_entry_market.lock().as_ref() {
                return Err(err.clone());
            }
            if let Some(amt) = *self.position_after_entry.lock() {
                let mark = *self.mark.lock();
                self.positions.lock().push(PositionInfo {
                    symbol: symbol.to_string(),
                    position_amt: amt,
                    entry_price: mark,
                    unrealized_pnl: 0.0,
                });
            }
        }

        Ok(OrderAck {
            order_id: self.next_order_id(),
        })
    }

    async fn create_conditional(
        &self,
        symbol: &str,
        side: Direction,
        kind: ConditionalKind,
        trigger_price: f64,
        working_type: WorkingType,
    ) -> VenueResult<OrderAck> {
        self.tick();
        let gate = match kind {
            ConditionalKind::StopMarket => &self.fail_stop_order,
            ConditionalKind::TakeProfitMarket => &self.fail_take_profit_order,
        };
        if let Some(err) = gate.lock().as_ref() {
            return Err(err.clone());
        }

        let id = self.next_order_id();
        self.conditional_calls.lock().push(ConditionalCall {
            symbol: symbol.to_string(),
            side,
            kind,
            trigger_price,
            working_type,
            id,
        });
        self.algo_orders.lock().push(OpenOrder {
            id,
            order_type: kind.as_str().to_string(),
            trigger_price: Some(trigger_price),
            channel: OrderChannel::Algo,
        });
        Ok(OrderAck { order_id: id })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: u64) -> VenueResult<()> {
        self.tick();
        self.classic_orders.lock().retain(|o| o.id != order_id);
        self.cancelled_classic.lock().push(order_id);
        Ok(())
    }

    async fn cancel_conditional(&self, _symbol: &str, algo_id: u64) -> VenueResult<()> {
        self.tick();
        self.algo_orders.lock().retain(|o| o.id != algo_id);
        self.cancelled_algo.lock().push(algo_id);
        Ok(())
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> VenueResult<()> {
        self.tick();
        *self.leverage_set.lock() = Some(leverage);
        Ok(())
    }

    async fn get_order(&self, _symbol: &str, _order_id: u64) -> VenueResult<OrderStatus> {
        self.tick();
        Ok(*self.entry_order_status.lock())
    }
}
