//! Venue Circuit Breaker
//!
//! Per-venue breaker guarding every connector call. Consecutive transient or
//! rate-limit failures inside a sliding window trip the circuit; after the
//! cooldown one probe call is let through. A failed probe re-opens the
//! circuit with a longer cooldown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::clock::{elapsed_between, to_chrono, Clock};
use crate::domain::Venue;
use crate::error::ConnectorError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,
    /// Failure threshold exceeded - calls short-circuit
    Open,
    /// Cooldown elapsed - a single probe call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for a venue circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that trip the circuit
    pub failure_threshold: u32,
    pub window: Duration,
    /// Base time spent OPEN before the first probe
    pub cooldown: Duration,
    /// Ceiling for the extended cooldown after failed probes
    pub max_cooldown: Duration,
    pub cooldown_multiplier: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
            cooldown_multiplier: 2,
        }
    }
}

/// Admission ticket for one guarded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPermit {
    probe: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

/// Trip reasons for the circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub enum TripReason {
    ConsecutiveFailures(u32),
    ProbeFailed,
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveFailures(n) => write!(f, "{} consecutive failures", n),
            TripReason::ProbeFailed => write!(f, "half-open probe failed"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    cooldown: Duration,
    probe_in_flight: bool,
    last_trip_reason: Option<TripReason>,
    last_failure: Option<DateTime<Utc>>,
}

/// Circuit breaker scoped to one venue
pub struct CircuitBreaker {
    venue: Venue,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    total_trips: AtomicU64,
    short_circuited: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(venue: Venue, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let cooldown = config.cooldown;
        Self {
            venue,
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                cooldown,
                probe_in_flight: false,
                last_trip_reason: None,
                last_failure: None,
            }),
            total_trips: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Admit a call or short-circuit it without touching the network.
    ///
    /// An OPEN circuit whose cooldown has elapsed moves to HALF_OPEN and
    /// hands out exactly one probe permit; further callers are rejected until
    /// the probe reports back.
    pub async fn try_acquire(&self) -> Result<BreakerPermit, ConnectorError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit { probe: false }),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = elapsed_between(opened_at, now);
                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(venue = %self.venue, "Circuit breaker transitioning to HALF-OPEN");
                    Ok(BreakerPermit { probe: true })
                } else {
                    self.short_circuited.fetch_add(1, Ordering::Relaxed);
                    Err(ConnectorError::CircuitOpen {
                        venue: self.venue,
                        retry_in: inner.cooldown.saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    self.short_circuited.fetch_add(1, Ordering::Relaxed);
                    Err(ConnectorError::CircuitOpen {
                        venue: self.venue,
                        retry_in: Duration::ZERO,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(BreakerPermit { probe: true })
                }
            }
        }
    }

    /// Report the outcome of an admitted call. Returns the new state when it changed.
    pub async fn on_result<T>(
        &self,
        permit: BreakerPermit,
        result: &Result<T, ConnectorError>,
    ) -> Option<CircuitState> {
        match result {
            Err(err) if err.counts_toward_breaker() => self.record_failure(permit).await,
            _ => self.record_success(permit).await,
        }
    }

    async fn record_success(&self, permit: BreakerPermit) -> Option<CircuitState> {
        let mut inner = self.inner.lock().await;
        inner.failures.clear();

        if permit.probe && inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            inner.cooldown = self.config.cooldown;
            info!(venue = %self.venue, "Circuit breaker CLOSED - probe succeeded");
            return Some(CircuitState::Closed);
        }
        None
    }

    async fn record_failure(&self, permit: BreakerPermit) -> Option<CircuitState> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(now);

        if permit.probe && inner.state == CircuitState::HalfOpen {
            let extended = inner
                .cooldown
                .saturating_mul(self.config.cooldown_multiplier.max(1))
                .min(self.config.max_cooldown);
            inner.cooldown = extended;
            self.trip(&mut inner, now, TripReason::ProbeFailed);
            return Some(CircuitState::Open);
        }

        if inner.state != CircuitState::Closed {
            return None;
        }

        let window_start = now - to_chrono(self.config.window);
        inner.failures.push_back(now);
        while inner.failures.front().is_some_and(|t| *t < window_start) {
            inner.failures.pop_front();
        }

        let failures = inner.failures.len() as u32;
        debug!(venue = %self.venue, failures, "Circuit breaker failure recorded");

        if failures >= self.config.failure_threshold {
            self.trip(&mut inner, now, TripReason::ConsecutiveFailures(failures));
            return Some(CircuitState::Open);
        }
        None
    }

    fn trip(&self, inner: &mut BreakerInner, now: DateTime<Utc>, reason: TripReason) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.probe_in_flight = false;
        inner.failures.clear();
        self.total_trips.fetch_add(1, Ordering::SeqCst);
        warn!(
            venue = %self.venue,
            cooldown_secs = inner.cooldown.as_secs(),
            "Circuit breaker TRIPPED: {}",
            reason
        );
        inner.last_trip_reason = Some(reason);
    }

    /// Force the circuit closed (operator reset)
    pub async fn force_close(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.failures.clear();
        inner.cooldown = self.config.cooldown;
        warn!(venue = %self.venue, "Circuit breaker force-closed");
    }

    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().await;
        CircuitBreakerStats {
            venue: self.venue,
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            opened_at: inner.opened_at,
            cooldown: inner.cooldown,
            last_failure: inner.last_failure,
            last_trip_reason: inner.last_trip_reason.as_ref().map(|r| r.to_string()),
            total_trips: self.total_trips.load(Ordering::SeqCst),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub venue: Venue,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_trip_reason: Option<String>,
    pub total_trips: u64,
    pub short_circuited: u64,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::clock::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(100),
            cooldown_multiplier: 2,
        };
        CircuitBreaker::new(Venue::Binance, config, clock)
    }

    fn transient() -> Result<(), ConnectorError> {
        Err(ConnectorError::TransientNetwork("timeout".into()))
    }

    async fn fail(cb: &CircuitBreaker) -> Option<CircuitState> {
        let permit = cb.try_acquire().await.unwrap();
        cb.on_result(permit, &transient()).await
    }

    #[tokio::test]
    async fn test_trips_after_threshold() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(clock);

        assert_eq!(fail(&cb).await, None);
        assert_eq!(fail(&cb).await, None);
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(fail(&cb).await, Some(CircuitState::Open));

        let err = cb.try_acquire().await.unwrap_err();
        assert!(matches!(err, ConnectorError::CircuitOpen { .. }));
        assert_eq!(cb.get_stats().await.short_circuited, 1);
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_forgotten() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(clock.clone());

        fail(&cb).await;
        fail(&cb).await;
        clock.advance(Duration::from_secs(61));
        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(clock);

        fail(&cb).await;
        fail(&cb).await;
        let permit = cb.try_acquire().await.unwrap();
        cb.on_result(permit, &Ok::<(), ConnectorError>(())).await;
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejections_do_not_count() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(clock);

        for _ in 0..5 {
            let permit = cb.try_acquire().await.unwrap();
            let rejected: Result<(), ConnectorError> =
                Err(ConnectorError::rejected("-2021", "order would immediately trigger"));
            cb.on_result(permit, &rejected).await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_single_probe_then_close() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(clock.clone());
        for _ in 0..3 {
            fail(&cb).await;
        }

        clock.advance(Duration::from_secs(30));
        let probe = cb.try_acquire().await.unwrap();
        assert!(probe.is_probe());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert!(cb.try_acquire().await.is_err());

        let changed = cb.on_result(probe, &Ok::<(), ConnectorError>(())).await;
        assert_eq!(changed, Some(CircuitState::Closed));
        assert!(!cb.try_acquire().await.unwrap().is_probe());
    }

    #[tokio::test]
    async fn test_probe_failure_extends_cooldown_up_to_cap() {
        let clock = Arc::new(ManualClock::default());
        let cb = breaker(clock.clone());
        for _ in 0..3 {
            fail(&cb).await;
        }

        clock.advance(Duration::from_secs(30));
        assert_eq!(fail(&cb).await, Some(CircuitState::Open));
        assert_eq!(cb.get_stats().await.cooldown, Duration::from_secs(60));

        clock.advance(Duration::from_secs(59));
        assert!(cb.try_acquire().await.is_err());
        clock.advance(Duration::from_secs(1));
        assert_eq!(fail(&cb).await, Some(CircuitState::Open));
        assert_eq!(cb.get_stats().await.cooldown, Duration::from_secs(100));
        assert_eq!(cb.get_stats().await.total_trips, 3);
    }
}
