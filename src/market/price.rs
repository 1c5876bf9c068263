// =============================================================================
// PriceView — fresh mark price and top-of-book for staleness checks
// =============================================================================
//
// Mark price and order book are deliberately NOT part of the symbol-spec
// cache: they move every second. An optional short-TTL (≤30 s) cache can be
// enabled to coalesce duplicate reads within one guardian fan-out;
// otherwise every read goes straight to the venue.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::venue::{VenueClient, VenueResult};

const BOOK_DEPTH: u32 = 20;

/// A fresh market snapshot used by freshness re-validation.
#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot {
    pub mark_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread_pct: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Fresh mark-price + order-book reader with an optional short-lived cache.
pub struct PriceView {
    cache_ttl: Option<Duration>,
    marks: RwLock<HashMap<String, (f64, Instant)>>,
}

impl PriceView {
    /// Every read goes to the venue.
    pub fn direct() -> Self {
        Self {
            cache_ttl: None,
            marks: RwLock::new(HashMap::new()),
        }
    }

    /// Reads within `ttl` of each other share one venue call per symbol.
    /// TTLs above 30 s defeat the point of a freshness check and are capped.
    pub fn cached(ttl: Duration) -> Self {
        Self {
            cache_ttl: Some(ttl.min(Duration::from_secs(30))),
            marks: RwLock::new(HashMap::new()),
        }
    }

    /// Current mark price for `symbol`.
    pub async fn mark_price(&self, venue: &dyn VenueClient, symbol: &str) -> VenueResult<f64> {
        let symbol = symbol.to_uppercase();

        if let Some(ttl) = self.cache_ttl {
            if let Some((mark, at)) = self.marks.read().get(&symbol) {
                if at.elapsed() < ttl {
                    return Ok(*mark);
                }
            }
            let mark = venue.mark_price(&symbol).await?;
            self.marks.write().insert(symbol, (mark, Instant::now()));
            return Ok(mark);
        }

        venue.mark_price(&symbol).await
    }

    /// Mark price plus top-of-book in one snapshot.
    pub async fn snapshot(
        &self,
        venue: &dyn VenueClient,
        symbol: &str,
    ) -> VenueResult<MarketSnapshot> {
        let symbol = symbol.to_uppercase();
        let mark_price = self.mark_price(venue, &symbol).await?;
        let book = venue.order_book(&symbol, BOOK_DEPTH).await?;

        let best_bid = book.best_bid().unwrap_or(0.0);
        let best_ask = book.best_ask().unwrap_or(0.0);
        let spread_pct = if best_ask > 0.0 {
            (best_ask - best_bid) / best_ask * 100.0
        } else {
            0.0
        };

        Ok(MarketSnapshot {
            mark_price,
            best_bid,
            best_ask,
            spread_pct,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::venue::mock::MockVenue;

    #[tokio::test(start_paused = true)]
    async fn direct_view_always_hits_the_venue() {
        let venue = MockVenue::new("BTCUSDT");
        *venue.mark.lock() = 50010.0;
        let view = PriceView::direct();

        view.mark_price(&venue, "BTCUSDT").await.unwrap();
        view.mark_price(&venue, "BTCUSDT").await.unwrap();
        assert_eq!(venue.total_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_view_coalesces_reads_within_ttl() {
        let venue = MockVenue::new("BTCUSDT");
        *venue.mark.lock() = 50010.0;
        let view = PriceView::cached(Duration::from_secs(30));

        assert_eq!(view.mark_price(&venue, "BTCUSDT").await.unwrap(), 50010.0);
        *venue.mark.lock() = 60000.0;
        // Still inside the TTL: the cached value wins.
        assert_eq!(view.mark_price(&venue, "btcusdt").await.unwrap(), 50010.0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(view.mark_price(&venue, "BTCUSDT").await.unwrap(), 60000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_carries_spread() {
        let venue = MockVenue::new("BTCUSDT");
        *venue.mark.lock() = 50000.0;
        let view = PriceView::direct();

        let snap = view.snapshot(&venue, "BTCUSDT").await.unwrap();
        assert_eq!(snap.mark_price, 50000.0);
        assert!(snap.best_bid < snap.best_ask);
        assert!(snap.spread_pct > 0.0);
    }
}
