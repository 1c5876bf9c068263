// =============================================================================
// Symbol filter & leverage-bracket caches — TTL 1 h, stale-on-error
// =============================================================================
//
// Exchange info and leverage brackets are close to static, so both are
// cached process-wide for an hour and refreshed on miss. When a refresh
// fails and a stale entry exists, the stale value is served with a warning;
// an empty cache plus a failed refresh is a hard error. Mark price and
// order book are NOT cached here — they go through `PriceView`.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{FatalKind, VenueError};
use crate::venue::{SymbolFilters, VenueClient, VenueResult};

const SPEC_TTL: Duration = Duration::from_secs(3600);

struct Stamped<T> {
    value: T,
    fetched_at: Instant,
}

/// Process-wide cache of per-symbol trading filters and max-leverage
/// brackets.
pub struct SpecCache {
    ttl: Duration,
    filters: RwLock<Option<Stamped<HashMap<String, SymbolFilters>>>>,
    brackets: RwLock<HashMap<String, Stamped<u32>>>,
}

impl Default for SpecCache {
    fn default() -> Self {
        Self::new(SPEC_TTL)
    }
}

impl SpecCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            filters: RwLock::new(None),
            brackets: RwLock::new(HashMap::new()),
        }
    }

    /// Filters for `symbol`, refreshing the exchange-info snapshot when the
    /// cache is cold or expired.
    pub async fn symbol_filters(
        &self,
        venue: &dyn VenueClient,
        symbol: &str,
    ) -> VenueResult<SymbolFilters> {
        let symbol = symbol.to_uppercase();

        // Fast path: fresh cache.
        {
            let cache = self.filters.read();
            if let Some(entry) = cache.as_ref() {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Self::lookup(&entry.value, &symbol);
                }
            }
        }

        match venue.exchange_info().await {
            Ok(info) => {
                debug!(symbols = info.symbols.len(), "exchange info refreshed");
                let result = Self::lookup(&info.symbols, &symbol);
                *self.filters.write() = Some(Stamped {
                    value: info.symbols,
                    fetched_at: Instant::now(),
                });
                result
            }
            Err(e) => {
                // Serve stale on refresh failure; empty cache is fatal.
                let cache = self.filters.read();
                if let Some(entry) = cache.as_ref() {
                    warn!(error = %e, "exchange info refresh failed, serving stale filters");
                    Self::lookup(&entry.value, &symbol)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Maximum initial leverage the venue allows for `symbol`.
    pub async fn max_leverage(
        &self,
        venue: &dyn VenueClient,
        symbol: &str,
    ) -> VenueResult<u32> {
        let symbol = symbol.to_uppercase();

        {
            let cache = self.brackets.read();
            if let Some(entry) = cache.get(&symbol) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value);
                }
            }
        }

        match venue.leverage_bracket(&symbol).await {
            Ok(leverage) => {
                self.brackets.write().insert(
                    symbol,
                    Stamped {
                        value: leverage,
                        fetched_at: Instant::now(),
                    },
                );
                Ok(leverage)
            }
            Err(e) => {
                let cache = self.brackets.read();
                if let Some(entry) = cache.get(&symbol) {
                    warn!(symbol = %symbol, error = %e, "bracket refresh failed, serving stale value");
                    Ok(entry.value)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn lookup(
        symbols: &HashMap<String, SymbolFilters>,
        symbol: &str,
    ) -> VenueResult<SymbolFilters> {
        symbols.get(symbol).copied().ok_or_else(|| {
            VenueError::fatal(
                FatalKind::Filter,
                format!("symbol {symbol} not found in exchange info"),
            )
        })
    }
}
