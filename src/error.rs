use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::domain::Venue;

/// Main error type for the warden engine
#[derive(Error, Debug)]
pub enum WardenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Ledger write failed: {0}")]
    LedgerWrite(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // State errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Venue loop halted: {0}")]
    Halted(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for WardenError
pub type Result<T> = std::result::Result<T, WardenError>;

/// Failure classes a connector call can surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    TransientNetwork,
    RateLimited,
    VenueRejected,
    AuthFailure,
    CircuitOpen,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientNetwork => "TRANSIENT_NETWORK",
            FailureKind::RateLimited => "RATE_LIMITED",
            FailureKind::VenueRejected => "VENUE_REJECTED",
            FailureKind::AuthFailure => "AUTH_FAILURE",
            FailureKind::CircuitOpen => "CIRCUIT_OPEN",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized venue failure taxonomy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("venue rejected request [{code}]: {reason}")]
    VenueRejected { code: String, reason: String },

    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error("circuit open for {venue}, retry in {retry_in:?}")]
    CircuitOpen { venue: Venue, retry_in: Duration },
}

impl ConnectorError {
    pub fn rejected(code: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectorError::VenueRejected {
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ConnectorError::TransientNetwork(_) => FailureKind::TransientNetwork,
            ConnectorError::RateLimited { .. } => FailureKind::RateLimited,
            ConnectorError::VenueRejected { .. } => FailureKind::VenueRejected,
            ConnectorError::AuthFailure(_) => FailureKind::AuthFailure,
            ConnectorError::CircuitOpen { .. } => FailureKind::CircuitOpen,
        }
    }

    /// Transient and rate-limit failures are retried; everything else is terminal for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::TransientNetwork(_) | ConnectorError::RateLimited { .. }
        )
    }

    pub fn counts_toward_breaker(&self) -> bool {
        self.is_retryable()
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectorError::AuthFailure(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConnectorError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            match status.as_u16() {
                401 | 403 => return ConnectorError::AuthFailure(err.to_string()),
                418 | 429 => return ConnectorError::RateLimited { retry_after: None },
                400..=499 => return ConnectorError::rejected(status.as_str(), err.to_string()),
                _ => {}
            }
        }
        ConnectorError::TransientNetwork(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectorError::TransientNetwork(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(ConnectorError::TransientNetwork("timeout".into()).is_retryable());
        assert!(ConnectorError::RateLimited { retry_after: None }.is_retryable());
        assert!(!ConnectorError::rejected("-2021", "would immediately trigger").is_retryable());
        assert!(!ConnectorError::AuthFailure("bad key".into()).is_retryable());
        assert!(!ConnectorError::CircuitOpen {
            venue: Venue::Binance,
            retry_in: Duration::from_secs(3)
        }
        .counts_toward_breaker());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let hint = Duration::from_millis(1500);
        assert_eq!(
            ConnectorError::RateLimited {
                retry_after: Some(hint)
            }
            .retry_after(),
            Some(hint)
        );
        assert_eq!(ConnectorError::TransientNetwork("x".into()).retry_after(), None);
    }
}
