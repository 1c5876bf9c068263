// =============================================================================
// Venue port — the capability boundary toward the exchange
// =============================================================================
//
// Everything the execution core needs from the venue goes through the
// `VenueClient` trait. The Binance USDⓈ-M futures implementation lives in
// `binance.rs`; `retry.rs` provides the retry decorator that higher layers
// actually hold. Tests script a `MockVenue` against the same trait.
// =============================================================================

pub mod binance;
pub mod retry;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::VenueError;
use crate::types::Direction;

pub type VenueResult<T> = Result<T, VenueError>;

// ---------------------------------------------------------------------------
// Order vocabulary
// ---------------------------------------------------------------------------

/// Kind of a conditional (trigger) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalKind {
    StopMarket,
    TakeProfitMarket,
}

impl ConditionalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Which price feed triggers a conditional order. Contract (last-trade)
/// price reacts faster in a crash; mark price avoids wick executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingType {
    ContractPrice,
    MarkPrice,
}

impl WorkingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContractPrice => "CONTRACT_PRICE",
            Self::MarkPrice => "MARK_PRICE",
        }
    }
}

/// Which API channel an open order came from. Cancellation must go back
/// through the same channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderChannel {
    /// Legacy open-orders endpoint.
    Classic,
    /// Conditional / algo-orders endpoint.
    Algo,
}

// ---------------------------------------------------------------------------
// Data shapes returned by the venue
// ---------------------------------------------------------------------------

/// Per-symbol trading filters. All values are strictly positive for a
/// tradeable symbol; the decimal count of `tick_size` / `step_size` defines
/// rounding precision.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
    pub min_price: f64,
    pub max_price: f64,
}

impl SymbolFilters {
    /// True when every filter needed for sizing and price rounding is
    /// present and positive.
    pub fn is_valid(&self) -> bool {
        self.tick_size > 0.0
            && self.step_size > 0.0
            && self.min_qty > 0.0
            && self.min_notional > 0.0
    }
}

/// Snapshot of exchange info: symbol → filters.
#[derive(Debug, Clone, Default)]
pub struct ExchangeInfo {
    pub symbols: HashMap<String, SymbolFilters>,
}

/// An order-book snapshot (price, quantity) levels, best first.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(p, _)| *p)
    }
}

/// A position as reported by the venue. `position_amt` is signed:
/// positive ⇒ LONG, negative ⇒ SHORT, zero ⇒ flat.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub position_amt: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

impl PositionInfo {
    pub fn is_open(&self) -> bool {
        self.position_amt.abs() > 0.0
    }
}

/// An open order on either channel, reduced to the fields the core needs.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub id: u64,
    pub order_type: String,
    pub trigger_price: Option<f64>,
    pub channel: OrderChannel,
}

impl OpenOrder {
    pub fn is_stop(&self) -> bool {
        matches!(self.order_type.as_str(), "STOP_MARKET" | "STOP")
    }

    pub fn is_take_profit(&self) -> bool {
        matches!(self.order_type.as_str(), "TAKE_PROFIT_MARKET" | "TAKE_PROFIT")
    }
}

/// Acknowledgement of a newly created order.
#[derive(Debug, Clone, Copy)]
pub struct OrderAck {
    pub order_id: u64,
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Other,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "NEW" => Self::New,
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "FILLED" => Self::Filled,
            "CANCELED" => Self::Canceled,
            "REJECTED" => Self::Rejected,
            "EXPIRED" => Self::Expired,
            _ => Self::Other,
        }
    }

    pub fn is_filled(self) -> bool {
        matches!(self, Self::Filled)
    }
}

// ---------------------------------------------------------------------------
// The port
// ---------------------------------------------------------------------------

/// Abstract contract for the exchange. One instance per user account.
///
/// Implementations must be cheap to clone behind `Arc`; every method is a
/// single venue round-trip with bounded wall-clock budget (connect ≈3 s,
/// read ≈5 s). Retrying is NOT an implementation concern — callers hold a
/// [`retry::RetryVenue`] wrapper.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Current mark price for `symbol`.
    async fn mark_price(&self, symbol: &str) -> VenueResult<f64>;

    /// Order-book snapshot limited to `depth` levels per side.
    async fn order_book(&self, symbol: &str, depth: u32) -> VenueResult<OrderBook>;

    /// Full exchange info (symbol filters).
    async fn exchange_info(&self) -> VenueResult<ExchangeInfo>;

    /// Maximum initial leverage for `symbol` from the venue's bracket table.
    async fn leverage_bracket(&self, symbol: &str) -> VenueResult<u32>;

    /// Free USDT balance on the futures account.
    async fn account_usdt_free(&self) -> VenueResult<f64>;

    /// Positions, optionally narrowed to one symbol.
    async fn positions(&self, symbol: Option<&str>) -> VenueResult<Vec<PositionInfo>>;

    /// Open orders on the legacy channel.
    async fn open_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>>;

    /// Open orders on the conditional / algo channel.
    async fn open_conditional_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>>;

    /// Submit a MARKET order. `quantity` is omitted when
    /// `close_position` is set (the venue flattens the whole position).
    async fn create_market(
        &self,
        symbol: &str,
        side: Direction,
        quantity: Option<f64>,
        reduce_only: bool,
        close_position: bool,
    ) -> VenueResult<OrderAck>;

    /// Submit a conditional order with `closePosition=true`.
    async fn create_conditional(
        &self,
        symbol: &str,
        side: Direction,
        kind: ConditionalKind,
        trigger_price: f64,
        working_type: WorkingType,
    ) -> VenueResult<OrderAck>;

    /// Cancel an order on the legacy channel.
    async fn cancel_order(&self, symbol: &str, order_id: u64) -> VenueResult<()>;

    /// Cancel an order on the conditional / algo channel.
    async fn cancel_conditional(&self, symbol: &str, algo_id: u64) -> VenueResult<()>;

    /// Set the account leverage for `symbol`.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()>;

    /// Current status of an order on the legacy channel.
    async fn get_order(&self, symbol: &str, order_id: u64) -> VenueResult<OrderStatus>;
}
