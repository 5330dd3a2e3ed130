//! Circuit-broken, retrying wrapper around a venue connector
//!
//! Every request-response call passes through the venue's breaker and the
//! retry policy. Backoff sleeps go through the injected [`Clock`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{ConnectorResult, VenueConnector};
use crate::coordination::{CircuitBreaker, CircuitState, Clock, RetryPolicy};
use crate::domain::{OrderHandle, PositionEvent, ProtectiveOrderSpec, RemotePosition, Venue, VenueOrder};
use crate::supervisor::AlertManager;

pub struct GuardedConnector {
    inner: Arc<dyn VenueConnector>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    alerts: Option<Arc<AlertManager>>,
}

impl GuardedConnector {
    pub fn new(
        inner: Arc<dyn VenueConnector>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            breaker,
            retry,
            clock,
            alerts: None,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut f: F) -> ConnectorResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = ConnectorResult<T>> + Send,
        T: Send + Sync,
    {
        let mut attempt = 0u32;
        loop {
            let permit = self.breaker.try_acquire().await?;
            let result = f().await;

            if let Some(CircuitState::Open) = self.breaker.on_result(permit, &result).await {
                if let Some(alerts) = &self.alerts {
                    let reason = result
                        .as_ref()
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    alerts
                        .circuit_breaker_opened(self.breaker.venue().as_str(), &reason)
                        .await;
                }
            }

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(venue = %self.breaker.venue(), operation, attempt, "Call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    let delay = self.retry.delay_for(attempt, &err);
                    warn!(
                        venue = %self.breaker.venue(),
                        operation,
                        attempt = attempt + 1,
                        failure_kind = %err.kind(),
                        delay_ms = delay.as_millis() as u64,
                        "Connector call failed, retrying: {}",
                        err
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl VenueConnector for GuardedConnector {
    fn venue(&self) -> Venue {
        self.inner.venue()
    }

    async fn list_positions(&self) -> ConnectorResult<Vec<RemotePosition>> {
        self.call("list_positions", || self.inner.list_positions())
            .await
    }

    async fn get_mark_price(&self, symbol: &str) -> ConnectorResult<Decimal> {
        self.call("get_mark_price", || self.inner.get_mark_price(symbol))
            .await
    }

    async fn place_protective_order(
        &self,
        spec: &ProtectiveOrderSpec,
    ) -> ConnectorResult<OrderHandle> {
        self.call("place_protective_order", || {
            self.inner.place_protective_order(spec)
        })
        .await
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> ConnectorResult<bool> {
        self.call("cancel_order", || {
            self.inner.cancel_order(symbol, venue_order_id)
        })
        .await
    }

    async fn list_protective_orders(&self) -> ConnectorResult<Vec<VenueOrder>> {
        self.call("list_protective_orders", || {
            self.inner.list_protective_orders()
        })
        .await
    }

    /// Streams reconnect with their own backoff and bypass the breaker
    fn stream_position_events(&self) -> BoxStream<'static, PositionEvent> {
        self.inner.stream_position_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CircuitBreakerConfig, ManualClock};
    use crate::error::ConnectorError;
    use crate::exchange::traits::MockVenueConnector;
    use std::time::Duration;

    fn no_delay_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 2,
            jitter: false,
        }
    }

    fn guard(mock: MockVenueConnector, retry: RetryPolicy) -> (GuardedConnector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let breaker = Arc::new(CircuitBreaker::new(
            Venue::Binance,
            CircuitBreakerConfig {
                failure_threshold: 3,
                ..CircuitBreakerConfig::default()
            },
            clock.clone(),
        ));
        (
            GuardedConnector::new(Arc::new(mock), breaker, retry, clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mut mock = MockVenueConnector::new();
        let mut calls = 0;
        mock.expect_list_positions().times(3).returning(move || {
            calls += 1;
            if calls < 3 {
                Err(ConnectorError::TransientNetwork("timeout".into()))
            } else {
                Ok(vec![])
            }
        });

        let (guarded, _) = guard(mock, no_delay_retry(5));
        assert!(guarded.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let mut mock = MockVenueConnector::new();
        mock.expect_cancel_order()
            .times(1)
            .returning(|_, _| Err(ConnectorError::rejected("-2011", "Unknown order")));

        let (guarded, _) = guard(mock, no_delay_retry(5));
        let err = guarded.cancel_order("BTCUSDT", "1").await.unwrap_err();
        assert!(matches!(err, ConnectorError::VenueRejected { .. }));
        assert_eq!(guarded.breaker().state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_network_calls() {
        let mut mock = MockVenueConnector::new();
        mock.expect_venue().return_const(Venue::Binance);
        // Three attempts trip the breaker; nothing further reaches the venue
        mock.expect_get_mark_price()
            .times(3)
            .returning(|_| Err(ConnectorError::TransientNetwork("reset".into())));

        let (guarded, clock) = guard(mock, no_delay_retry(1));
        for _ in 0..3 {
            assert!(guarded.get_mark_price("BTCUSDT").await.is_err());
        }
        assert_eq!(guarded.breaker().state().await, CircuitState::Open);

        let err = guarded.get_mark_price("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ConnectorError::CircuitOpen { .. }));

        clock.advance(Duration::from_secs(5));
        let err = guarded.get_mark_price("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, ConnectorError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn breaker_trip_raises_warning_alert() {
        let mut mock = MockVenueConnector::new();
        mock.expect_list_protective_orders()
            .returning(|| Err(ConnectorError::RateLimited { retry_after: None }));

        let alerts = Arc::new(AlertManager::with_defaults());
        let (guarded, _) = guard(mock, no_delay_retry(3));
        let guarded = guarded.with_alerts(alerts.clone());

        assert!(guarded.list_protective_orders().await.is_err());
        assert!(alerts.is_active("breaker:binance").await);
    }
}
