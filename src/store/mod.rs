// =============================================================================
// Store ports — rules, trade records, and trade-history reads
// =============================================================================
//
// The persistent store is an external collaborator; the core talks to it
// through three narrow traits so the SQLite implementation and the test
// fakes are interchangeable. Symbols are stored lowercase; callers pass
// whatever casing they have and the implementations normalize.
// =============================================================================

pub mod live_trade;
pub mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::rules::UserRules;
use crate::types::{ExitReason, TradeRecord};

/// Rules as loaded from the store: the rule set plus the user's banned
/// symbols list.
#[derive(Debug, Clone, Default)]
pub struct StoredRules {
    pub rules: UserRules,
    pub banned_symbols: Vec<String>,
}

/// Read side of per-user rule configuration.
pub trait RulesRepo: Send + Sync {
    /// Rules for `(user_id, strategy)`, or `None` when the user has no row.
    fn user_rules(&self, user_id: &str, strategy: &str) -> Result<Option<StoredRules>>;
}

/// Write side of the trade lifecycle.
pub trait TradeRepo: Send + Sync {
    /// Persist a freshly opened trade. Returns the row id.
    fn record_open(&self, record: &TradeRecord) -> Result<i64>;

    /// Close out the most recent active trade for `(user, strategy, symbol)`.
    /// Returns false when no active trade exists.
    fn update_exit(
        &self,
        user_id: &str,
        strategy: &str,
        symbol: &str,
        exit_reason: ExitReason,
        exit_price: f64,
        pnl: f64,
        exit_time: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Read side of trade history, used by the rule engine.
pub trait HistoryRepo: Send + Sync {
    /// Exit reason and exit time of the last closed trade for
    /// `(user, strategy, symbol)`.
    fn last_trade_for_symbol(
        &self,
        user_id: &str,
        strategy: &str,
        symbol: &str,
    ) -> Result<Option<(ExitReason, DateTime<Utc>)>>;

    /// Length of the current consecutive-loss run and the timestamp of the
    /// most recent loss. Scans closed trades newest-first (at most 50)
    /// until the first win.
    fn consecutive_losses(
        &self,
        user_id: &str,
        strategy: &str,
    ) -> Result<(u32, Option<DateTime<Utc>>)>;
}
