// =============================================================================
// SQLite store — user rules, trade records, trade-history reads
// =============================================================================
//
// Single-file store behind a mutex-guarded connection. Symbols are
// normalized to lowercase on every write and compared lowercase on every
// read, regardless of the casing callers pass in. Timestamps are stored as
// RFC 3339 strings in UTC.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::rules::UserRules;
use crate::types::{ExitReason, TradeRecord};

use super::{HistoryRepo, RulesRepo, StoredRules, TradeRepo};

/// How many closed trades the consecutive-loss scan looks back over.
/// Enough for the deepest circuit-breaker tier.
const LOSS_SCAN_LIMIT: u32 = 50;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite store at {path}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path, "sqlite store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS trade_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_order_id INTEGER,
                sl_order_id INTEGER,
                tp_order_id INTEGER,
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                quantity REAL NOT NULL,
                rr REAL NOT NULL,
                leverage INTEGER NOT NULL,
                capital_risked REAL NOT NULL,
                probability REAL NOT NULL,
                ev REAL,
                grok_meta TEXT NOT NULL,
                rules_snapshot TEXT NOT NULL,
                signal_timestamp TEXT,
                created_at TEXT NOT NULL,
                exit_reason TEXT NOT NULL DEFAULT 'active',
                exit_time TEXT,
                exit_price REAL,
                pnl REAL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trade_records_user_strategy
                ON trade_records(user_id, strategy, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_trade_records_symbol
                ON trade_records(user_id, strategy, symbol);

            CREATE TABLE IF NOT EXISTS user_rules (
                user_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                rules_config TEXT NOT NULL,
                banned_symbols TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (user_id, strategy)
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Insert or replace the rule row for `(user_id, strategy)`.
    pub fn upsert_rules(
        &self,
        user_id: &str,
        strategy: &str,
        rules: &UserRules,
        banned_symbols: &[String],
    ) -> Result<()> {
        let rules_json = serde_json::to_string(rules)?;
        let banned: Vec<String> = banned_symbols.iter().map(|s| s.to_lowercase()).collect();
        let banned_json = serde_json::to_string(&banned)?;

        self.conn.lock().execute(
            "INSERT INTO user_rules (user_id, strategy, rules_config, banned_symbols)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, strategy)
             DO UPDATE SET rules_config = ?3, banned_symbols = ?4",
            params![user_id, strategy, rules_json, banned_json],
        )?;
        Ok(())
    }
}

impl RulesRepo for SqliteStore {
    fn user_rules(&self, user_id: &str, strategy: &str) -> Result<Option<StoredRules>> {
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT rules_config, banned_symbols FROM user_rules
                 WHERE user_id = ?1 AND strategy = ?2",
                params![user_id, strategy],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((rules_json, banned_json)) = row else {
            return Ok(None);
        };

        let rules: UserRules = serde_json::from_str(&rules_json)
            .with_context(|| format!("invalid rules_config for {user_id}/{strategy}"))?;
        let banned_symbols: Vec<String> = serde_json::from_str(&banned_json).unwrap_or_default();

        Ok(Some(StoredRules {
            rules,
            banned_symbols,
        }))
    }
}

impl TradeRepo for SqliteStore {
    fn record_open(&self, record: &TradeRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trade_records (
                user_id, strategy, symbol, direction,
                entry_order_id, sl_order_id, tp_order_id,
                entry_price, stop_loss, take_profit, quantity, rr, leverage,
                capital_risked, probability, ev, grok_meta, rules_snapshot,
                signal_timestamp, created_at, exit_reason, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                record.user_id,
                record.strategy,
                record.symbol.to_lowercase(),
                record.direction.as_str(),
                record.order_ids.entry.map(|v| v as i64),
                record.order_ids.sl.map(|v| v as i64),
                record.order_ids.tp.map(|v| v as i64),
                record.entry_price,
                record.stop_loss,
                record.take_profit,
                record.quantity,
                record.rr,
                record.leverage,
                record.capital_risked,
                record.probability,
                record.ev,
                serde_json::to_string(&record.grok)?,
                record.rules_snapshot.to_string(),
                record.signal_timestamp.map(|t| t.to_rfc3339()),
                record.created_at.to_rfc3339(),
                record.exit_reason.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_exit(
        &self,
        user_id: &str,
        strategy: &str,
        symbol: &str,
        exit_reason: ExitReason,
        exit_price: f64,
        pnl: f64,
        exit_time: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE trade_records
             SET exit_reason = ?1, exit_price = ?2, pnl = ?3,
                 exit_time = ?4, updated_at = ?4
             WHERE id = (
                 SELECT id FROM trade_records
                 WHERE user_id = ?5 AND strategy = ?6 AND symbol = ?7
                   AND exit_reason = 'active'
                 ORDER BY created_at DESC LIMIT 1
             )",
            params![
                exit_reason.as_str(),
                exit_price,
                pnl,
                exit_time.to_rfc3339(),
                user_id,
                strategy,
                symbol.to_lowercase(),
            ],
        )?;
        Ok(changed > 0)
    }
}

impl HistoryRepo for SqliteStore {
    fn last_trade_for_symbol(
        &self,
        user_id: &str,
        strategy: &str,
        symbol: &str,
    ) -> Result<Option<(ExitReason, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT exit_reason, exit_time FROM trade_records
                 WHERE user_id = ?1 AND strategy = ?2 AND symbol = ?3
                   AND exit_reason != 'active'
                 ORDER BY exit_time DESC LIMIT 1",
                params![user_id, strategy, symbol.to_lowercase()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((reason_str, exit_time)) = row else {
            return Ok(None);
        };
        let (Some(reason), Some(time_str)) = (ExitReason::parse(&reason_str), exit_time) else {
            return Ok(None);
        };

        let exit_time = DateTime::parse_from_rfc3339(&time_str)
            .context("invalid exit_time in trade_records")?
            .with_timezone(&Utc);
        Ok(Some((reason, exit_time)))
    }

    fn consecutive_losses(
        &self,
        user_id: &str,
        strategy: &str,
    ) -> Result<(u32, Option<DateTime<Utc>>)> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT exit_reason, created_at FROM trade_records
             WHERE user_id = ?1 AND strategy = ?2 AND exit_reason != 'active'
             ORDER BY created_at DESC LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![user_id, strategy, LOSS_SCAN_LIMIT], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut losses = 0u32;
        let mut last_loss_time: Option<DateTime<Utc>> = None;

        for row in rows {
            let (reason_str, created_at) = row?;
            let Some(reason) = ExitReason::parse(&reason_str) else {
                continue;
            };

            if reason.is_loss() {
                losses += 1;
                if last_loss_time.is_none() {
                    last_loss_time = Some(
                        DateTime::parse_from_rfc3339(&created_at)
                            .context("invalid created_at in trade_records")?
                            .with_timezone(&Utc),
                    );
                }
            } else if reason.is_win() {
                break;
            }
            // Breakeven and guardian closes neither extend nor end the run.
        }

        Ok((losses, last_loss_time))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::types::{Direction, GrokMeta, OrderIds};

    fn record(symbol: &str, created_at: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            symbol: symbol.to_string(),
            user_id: "u1".to_string(),
            strategy: "archer_model".to_string(),
            direction: Direction::Buy,
            order_ids: OrderIds {
                entry: Some(1),
                sl: Some(2),
                tp: Some(3),
            },
            entry_price: 50000.0,
            stop_loss: 49500.0,
            take_profit: 51000.0,
            quantity: 0.2,
            rr: 2.0,
            leverage: 20,
            capital_risked: 100.0,
            probability: 70.0,
            ev: Some(1.2),
            grok: GrokMeta::default(),
            rules_snapshot: serde_json::json!({}),
            signal_timestamp: None,
            created_at,
            exit_reason: ExitReason::Active,
            exit_time: None,
            exit_price: None,
            pnl: None,
        }
    }

    fn close(
        store: &SqliteStore,
        symbol: &str,
        reason: ExitReason,
        exit_time: DateTime<Utc>,
    ) {
        assert!(store
            .update_exit("u1", "archer_model", symbol, reason, 49500.0, -100.0, exit_time)
            .unwrap());
    }

    #[test]
    fn rules_roundtrip_with_banned_symbols() {
        let store = SqliteStore::in_memory().unwrap();
        let mut rules = UserRules::default();
        rules.enabled = true;
        rules.risk_pct = 2.5;

        store
            .upsert_rules("u1", "archer_model", &rules, &["SHIBUSDT".to_string()])
            .unwrap();

        let stored = store.user_rules("u1", "archer_model").unwrap().unwrap();
        assert!(stored.rules.enabled);
        assert_eq!(stored.rules.risk_pct, 2.5);
        assert_eq!(stored.banned_symbols, vec!["shibusdt"]);

        assert!(store.user_rules("u1", "other").unwrap().is_none());
    }

    #[test]
    fn open_then_exit_updates_only_the_active_row() {
        let store = SqliteStore::in_memory().unwrap();
        let t0 = Utc::now();

        store.record_open(&record("BTCUSDT", t0)).unwrap();
        close(&store, "BTCUSDT", ExitReason::StopHit, t0 + Duration::hours(1));

        // No active row remains, so a second update is a no-op.
        assert!(!store
            .update_exit(
                "u1",
                "archer_model",
                "btcusdt",
                ExitReason::TargetHit,
                51000.0,
                200.0,
                t0 + Duration::hours(2),
            )
            .unwrap());

        let (reason, _) = store
            .last_trade_for_symbol("u1", "archer_model", "BTCUSDT")
            .unwrap()
            .unwrap();
        assert_eq!(reason, ExitReason::StopHit);
    }

    #[test]
    fn symbol_lookup_is_case_insensitive() {
        let store = SqliteStore::in_memory().unwrap();
        let t0 = Utc::now();
        store.record_open(&record("ETHUSDT", t0)).unwrap();
        close(&store, "ethusdt", ExitReason::ManualCloseLost, t0 + Duration::hours(1));

        assert!(store
            .last_trade_for_symbol("u1", "archer_model", "EthUsdt")
            .unwrap()
            .is_some());
    }

    #[test]
    fn consecutive_losses_scan_stops_at_first_win() {
        let store = SqliteStore::in_memory().unwrap();
        let t0 = Utc::now() - Duration::hours(10);

        // Oldest → newest: win, loss, loss, loss.
        let sequence = [
            (ExitReason::TargetHit, 0),
            (ExitReason::StopHit, 1),
            (ExitReason::TimeoutLost, 2),
            (ExitReason::StopHit, 3),
        ];
        for (i, (reason, hour)) in sequence.iter().enumerate() {
            let opened = t0 + Duration::hours(*hour);
            let symbol = format!("SYM{i}USDT");
            store.record_open(&record(&symbol, opened)).unwrap();
            close(&store, &symbol, *reason, opened + Duration::minutes(30));
        }

        let (losses, last_loss) = store.consecutive_losses("u1", "archer_model").unwrap();
        assert_eq!(losses, 3);
        // Most recent loss is the newest closed row.
        assert_eq!(last_loss.unwrap(), t0 + Duration::hours(3));
    }

    #[test]
    fn breakeven_closes_do_not_break_the_loss_run() {
        let store = SqliteStore::in_memory().unwrap();
        let t0 = Utc::now() - Duration::hours(10);

        let sequence = [
            (ExitReason::StopHit, 0),
            (ExitReason::TimeoutBreakeven, 1),
            (ExitReason::StopHit, 2),
        ];
        for (i, (reason, hour)) in sequence.iter().enumerate() {
            let opened = t0 + Duration::hours(*hour);
            let symbol = format!("SYM{i}USDT");
            store.record_open(&record(&symbol, opened)).unwrap();
            close(&store, &symbol, *reason, opened + Duration::minutes(30));
        }

        let (losses, _) = store.consecutive_losses("u1", "archer_model").unwrap();
        assert_eq!(losses, 2);
    }

    #[test]
    fn file_backed_store_reopens_with_schema_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.db");
        let path = path.to_str().unwrap();

        let store = SqliteStore::open(path).unwrap();
        let t0 = Utc::now();
        store.record_open(&record("BTCUSDT", t0)).unwrap();
        close(&store, "BTCUSDT", ExitReason::StopHit, t0 + Duration::hours(1));
        drop(store);

        let store = SqliteStore::open(path).unwrap();
        let (reason, _) = store
            .last_trade_for_symbol("u1", "archer_model", "BTCUSDT")
            .unwrap()
            .unwrap();
        assert_eq!(reason, ExitReason::StopHit);
    }

    #[test]
    fn no_history_means_zero_losses() {
        let store = SqliteStore::in_memory().unwrap();
        let (losses, last) = store.consecutive_losses("u1", "archer_model").unwrap();
        assert_eq!(losses, 0);
        assert!(last.is_none());
        assert!(store
            .last_trade_for_symbol("u1", "archer_model", "BTCUSDT")
            .unwrap()
            .is_none());
    }
}
