// =============================================================================
// LiveTrade store — trade state shared with the guardian monitor
// =============================================================================
//
// One record per (user, symbol), written when a trade opens, mutated on
// every stop adjustment, deleted on close. Entries carry a 7-day TTL so an
// abandoned record cannot outlive any realistic trade.
//
// `original_stop` is write-once: it is set on the first adjustment (to the
// stop being replaced) and every later write must preserve it. The stop
// value is mirrored in `stop_loss` for consumers that read either name.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const LIVE_TRADE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// The mutable record the guardian reads for a live position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTrade {
    pub entry: f64,
    pub stop: f64,
    /// Mirror of `stop` kept for consumers reading the other field name.
    pub stop_loss: f64,
    pub target: f64,
    /// The stop in place before the first adjustment. Set exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_stop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_level_applied: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_previous_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_previous_stop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_last_adjustment_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_last_adjustment_stop: Option<f64>,
}

impl LiveTrade {
    /// Fresh record for a just-opened trade.
    pub fn opened(entry: f64, stop: f64, target: f64) -> Self {
        Self {
            entry,
            stop,
            stop_loss: stop,
            target,
            original_stop: None,
            ts_level_applied: None,
            ts_previous_level: None,
            ts_previous_stop: None,
            ts_last_adjustment_ts: None,
            ts_last_adjustment_stop: None,
        }
    }
}

/// External-cache port for live trades. The in-process implementation below
/// is the default; a networked cache can stand in behind the same trait.
pub trait LiveTradeStore: Send + Sync {
    fn get(&self, user_id: &str, symbol: &str) -> Result<Option<LiveTrade>>;
    fn put(&self, user_id: &str, symbol: &str, trade: &LiveTrade) -> Result<()>;
    fn delete(&self, user_id: &str, symbol: &str) -> Result<()>;
}

/// In-process LiveTrade store with per-entry TTL.
pub struct MemoryLiveTradeStore {
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), (LiveTrade, Instant)>>,
}

impl Default for MemoryLiveTradeStore {
    fn default() -> Self {
        Self::new(LIVE_TRADE_TTL)
    }
}

impl MemoryLiveTradeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(user_id: &str, symbol: &str) -> (String, String) {
        (user_id.to_string(), symbol.to_uppercase())
    }
}

impl LiveTradeStore for MemoryLiveTradeStore {
    fn get(&self, user_id: &str, symbol: &str) -> Result<Option<LiveTrade>> {
        let key = Self::key(user_id, symbol);
        let entries = self.entries.read();
        Ok(entries.get(&key).and_then(|(trade, stored_at)| {
            (stored_at.elapsed() < self.ttl).then(|| trade.clone())
        }))
    }

    fn put(&self, user_id: &str, symbol: &str, trade: &LiveTrade) -> Result<()> {
        let key = Self::key(user_id, symbol);
        self.entries
            .write()
            .insert(key, (trade.clone(), Instant::now()));
        Ok(())
    }

    fn delete(&self, user_id: &str, symbol: &str) -> Result<()> {
        self.entries.write().remove(&Self::key(user_id, symbol));
        Ok(())
    }
}
