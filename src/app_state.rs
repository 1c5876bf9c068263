// =============================================================================
// Central application state — Archer execution core
// =============================================================================
//
// Wires the fleet, caches, stores, and executors together once at startup.
// Every HTTP handler holds an `Arc<AppState>`; subsystems manage their own
// interior mutability, so the state itself is immutable after construction.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::config::ExecConfig;
use crate::exec::{PositionGuard, StopAdjuster};
use crate::fleet::{Fleet, UserAccount};
use crate::guardian::dispatcher::GuardianDispatcher;
use crate::market::{PriceView, SpecCache};
use crate::store::live_trade::{LiveTradeStore, MemoryLiveTradeStore};
use crate::store::sqlite::SqliteStore;
use crate::store::{HistoryRepo, RulesRepo, TradeRepo};
use crate::venue::binance::BinanceFutures;
use crate::venue::retry::RetryVenue;

pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub rules: Arc<dyn RulesRepo>,
    pub history: Arc<dyn HistoryRepo>,
    pub guard: Arc<PositionGuard>,
    pub dispatcher: Arc<GuardianDispatcher>,
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Build the full production wiring from configuration.
    pub fn build(config: &ExecConfig) -> Result<Arc<Self>> {
        let store = Arc::new(SqliteStore::open(&config.db_path)?);

        let fleet = Arc::new(Fleet::new(
            config
                .users
                .iter()
                .map(|creds| UserAccount {
                    user_id: creds.user_id.clone(),
                    venue: Arc::new(RetryVenue::new(Arc::new(BinanceFutures::new(
                        creds.api_key.clone(),
                        creds.api_secret.clone(),
                        config.testnet,
                    )))) as Arc<dyn crate::venue::VenueClient>,
                })
                .collect(),
        ));

        let price_view = Arc::new(match config.price_cache_secs {
            Some(secs) => PriceView::cached(Duration::from_secs(secs)),
            None => PriceView::direct(),
        });

        info!(
            users = fleet.len(),
            testnet = config.testnet,
            price_cache_secs = ?config.price_cache_secs,
            "fleet constructed"
        );

        Ok(Self::assemble(
            fleet,
            store.clone(),
            store.clone(),
            store,
            Arc::new(MemoryLiveTradeStore::default()),
            price_view,
        ))
    }

    /// Wire the subsystems from already-built parts (tests inject mocks
    /// through this path).
    pub fn assemble(
        fleet: Arc<Fleet>,
        rules: Arc<dyn RulesRepo>,
        history: Arc<dyn HistoryRepo>,
        trades: Arc<dyn TradeRepo>,
        live_trades: Arc<dyn LiveTradeStore>,
        price_view: Arc<PriceView>,
    ) -> Arc<Self> {
        let spec_cache = Arc::new(SpecCache::default());

        let guard = Arc::new(PositionGuard::new(
            spec_cache.clone(),
            price_view.clone(),
            trades.clone(),
            live_trades.clone(),
        ));

        let adjuster = Arc::new(StopAdjuster::new(
            spec_cache,
            price_view.clone(),
            live_trades.clone(),
        ));

        let dispatcher = Arc::new(GuardianDispatcher::new(
            fleet.clone(),
            rules.clone(),
            trades,
            live_trades,
            price_view,
            adjuster,
        ));

        Arc::new(Self {
            fleet,
            rules,
            history,
            guard,
            dispatcher,
            started_at: std::time::Instant::now(),
        })
    }
}
