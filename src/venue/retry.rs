// =============================================================================
// Retry decorator around the venue port
// =============================================================================
//
// Wraps any `VenueClient` so that transient failures (rate limit, 5xx,
// timestamp skew, network faults) are retried with exponential backoff
// while deterministic rejections fail fast. The wrapped interface is
// identical to the raw port, so higher layers see at-most-once successes
// on the happy path and canonical errors otherwise.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::warn;

use crate::types::Direction;

use super::{
    ConditionalKind, ExchangeInfo, OpenOrder, OrderAck, OrderBook, OrderStatus, PositionInfo,
    VenueClient, VenueResult, WorkingType,
};

/// Retry configuration. Defaults: 3 retries, backoff 1 s, 2 s, 4 s,
/// capped at 10 s.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }
}

/// Venue client wrapper applying [`RetryPolicy`] to every call.
pub struct RetryVenue<C> {
    inner: Arc<C>,
    policy: RetryPolicy,
}

impl<C: VenueClient> RetryVenue<C> {
    pub fn new(inner: Arc<C>) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(inner: Arc<C>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> VenueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VenueResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        max = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient venue error, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<C: VenueClient> VenueClient for RetryVenue<C> {
    async fn mark_price(&self, symbol: &str) -> VenueResult<f64> {
        self.call("mark_price", || self.inner.mark_price(symbol)).await
    }

    async fn order_book(&self, symbol: &str, depth: u32) -> VenueResult<OrderBook> {
        self.call("order_book", || self.inner.order_book(symbol, depth))
            .await
    }

    async fn exchange_info(&self) -> VenueResult<ExchangeInfo> {
        self.call("exchange_info", || self.inner.exchange_info()).await
    }

    async fn leverage_bracket(&self, symbol: &str) -> VenueResult<u32> {
        self.call("leverage_bracket", || self.inner.leverage_bracket(symbol))
            .await
    }

    async fn account_usdt_free(&self) -> VenueResult<f64> {
        self.call("account_usdt_free", || self.inner.account_usdt_free())
            .await
    }

    async fn positions(&self, symbol: Option<&str>) -> VenueResult<Vec<PositionInfo>> {
        self.call("positions", || self.inner.positions(symbol)).await
    }

    async fn open_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        self.call("open_orders", || self.inner.open_orders(symbol)).await
    }

    async fn open_conditional_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        self.call("open_conditional_orders", || {
            self.inner.open_conditional_orders(symbol)
        })
        .await
    }

    async fn create_market(
        &self,
        symbol: &str,
        side: Direction,
        quantity: Option<f64>,
        reduce_only: bool,
        close_position: bool,
    ) -> VenueResult<OrderAck> {
        self.call("create_market", || {
            self.inner
                .create_market(symbol, side, quantity, reduce_only, close_position)
        })
        .await
    }

    async fn create_conditional(
        &self,
        symbol: &str,
        side: Direction,
        kind: ConditionalKind,
        trigger_price: f64,
        working_type: WorkingType,
    ) -> VenueResult<OrderAck> {
        self.call("create_conditional", || {
            self.inner
                .create_conditional(symbol, side, kind, trigger_price, working_type)
        })
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> VenueResult<()> {
        self.call("cancel_order", || self.inner.cancel_order(symbol, order_id))
            .await
    }

    async fn cancel_conditional(&self, symbol: &str, algo_id: u64) -> VenueResult<()> {
        self.call("cancel_conditional", || {
            self.inner.cancel_conditional(symbol, algo_id)
        })
        .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()> {
        self.call("set_leverage", || self.inner.set_leverage(symbol, leverage))
            .await
    }

    async fn get_order(&self, symbol: &str, order_id: u64) -> VenueResult<OrderStatus> {
        self.call("get_order", || self.inner.get_order(symbol, order_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::super::mock::MockVenue;
    use super::*;
    use crate::error::{FatalKind, VenueError};

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let venue = Arc::new(MockVenue::new("BTCUSDT"));
        *venue.mark.lock() = 50010.0;

        let failures = Arc::new(AtomicU32::new(2));
        *venue.fail_mark_price.lock() = Some((
            failures.clone(),
            VenueError::transient("rate limit"),
        ));

        let retry = RetryVenue::new(venue);
        let mark = retry.mark_price("BTCUSDT").await.unwrap();
        assert_eq!(mark, 50010.0);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhaustion_surfaces_the_error() {
        let venue = Arc::new(MockVenue::new("BTCUSDT"));
        *venue.fail_mark_price.lock() = Some((
            Arc::new(AtomicU32::new(u32::MAX)),
            VenueError::transient("down"),
        ));

        let retry = RetryVenue::new(venue);
        let err = retry.mark_price("BTCUSDT").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let venue = Arc::new(MockVenue::new("BTCUSDT"));
        let remaining = Arc::new(AtomicU32::new(u32::MAX));
        *venue.fail_mark_price.lock() = Some((
            remaining.clone(),
            VenueError::fatal(FatalKind::Auth, "bad key"),
        ));

        let retry = RetryVenue::new(venue);
        let err = retry.mark_price("BTCUSDT").await.unwrap_err();
        assert!(!err.is_transient());
        // Exactly one attempt was consumed.
        assert_eq!(remaining.load(Ordering::SeqCst), u32::MAX - 1);
    }
}
