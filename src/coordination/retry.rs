//! Retry policy for connector calls
//!
//! Bounded exponential backoff for transient and rate-limited failures.
//! Venue retry-after hints take precedence over the computed delay.

use rand::Rng;
use std::time::Duration;

use crate::error::ConnectorError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Spread delays by up to 25% to avoid synchronized retries across venues
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries; used by one-shot audit runs
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a failed attempt (0-based) should be followed by another
    pub fn should_retry(&self, err: &ConnectorError, attempt: u32) -> bool {
        err.is_retryable() && attempt + 1 < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32, err: &ConnectorError) -> Duration {
        if let Some(hint) = err.retry_after() {
            return hint.min(self.max_delay);
        }

        let factor = self.multiplier.max(1).saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let spread = delay.as_millis() as u64 / 4;
            if spread > 0 {
                let offset = rand::thread_rng().gen_range(0..=spread);
                return delay
                    .saturating_sub(Duration::from_millis(spread / 2))
                    .saturating_add(Duration::from_millis(offset))
                    .min(self.max_delay);
            }
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let p = policy();
        let err = ConnectorError::TransientNetwork("reset".into());
        assert_eq!(p.delay_for(0, &err), Duration::from_secs(1));
        assert_eq!(p.delay_for(1, &err), Duration::from_secs(2));
        assert_eq!(p.delay_for(3, &err), Duration::from_secs(8));
        assert_eq!(p.delay_for(10, &err), Duration::from_secs(30));
    }

    #[test]
    fn rate_limit_hint_wins() {
        let p = policy();
        let err = ConnectorError::RateLimited {
            retry_after: Some(Duration::from_millis(2500)),
        };
        assert_eq!(p.delay_for(0, &err), Duration::from_millis(2500));
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        let p = policy();
        assert!(!p.should_retry(&ConnectorError::AuthFailure("invalid key".into()), 0));
        assert!(!p.should_retry(&ConnectorError::rejected("10001", "bad price"), 0));
        assert!(p.should_retry(&ConnectorError::TransientNetwork("x".into()), 3));
        assert!(!p.should_retry(&ConnectorError::TransientNetwork("x".into()), 4));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RetryPolicy::default();
        let err = ConnectorError::TransientNetwork("x".into());
        for _ in 0..50 {
            let d = p.delay_for(2, &err);
            assert!(d >= Duration::from_millis(3500) && d <= Duration::from_millis(4500));
        }
    }
}
