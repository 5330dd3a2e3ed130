use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::coordination::{CircuitBreakerConfig, RetryPolicy};
use crate::domain::{ActivationReference, ProtectionPolicy, Venue};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub venues: Vec<VenueConfig>,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status_server: StatusServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectionConfig {
    /// Stop-loss distance from entry, in percent (6.5 = 6.5%)
    pub stop_loss_percent: Decimal,
    /// Trailing callback in percent; 0 disables the trailing stop
    pub trailing_callback_rate: Decimal,
    pub trailing_activation_percent: Decimal,
    #[serde(default)]
    pub activation_reference: ActivationReference,
    /// When false the monitor only reports coverage
    pub mandatory_protection: bool,
    #[serde(default)]
    pub take_profit_percent: Option<Decimal>,
    /// Cycles an open position may stay without an active stop before alerting
    pub grace_cycles: u32,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        let policy = ProtectionPolicy::default();
        Self {
            stop_loss_percent: policy.stop_loss_percent,
            trailing_callback_rate: policy.trailing_callback_rate,
            trailing_activation_percent: policy.trailing_activation_percent,
            activation_reference: policy.activation_reference,
            mandatory_protection: policy.mandatory,
            take_profit_percent: policy.take_profit_percent,
            grace_cycles: 2,
        }
    }
}

impl ProtectionConfig {
    pub fn policy(&self) -> ProtectionPolicy {
        ProtectionPolicy {
            stop_loss_percent: self.stop_loss_percent,
            trailing_callback_rate: self.trailing_callback_rate,
            trailing_activation_percent: self.trailing_activation_percent,
            mandatory: self.mandatory_protection,
            activation_reference: self.activation_reference,
            take_profit_percent: self.take_profit_percent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub poll_interval_seconds: u64,
    /// Subscribe to venue position streams for low-latency scoped passes
    pub stream_enabled: bool,
    pub event_queue_capacity: usize,
    /// Positions protected concurrently within one cycle
    pub max_concurrent_positions: usize,
    pub shutdown_timeout_seconds: u64,
    /// Consecutive passes a discrepancy may persist before escalating
    pub discrepancy_escalation_passes: u32,
    /// Consecutive authentication failures that halt a venue loop
    pub max_auth_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            stream_enabled: true,
            event_queue_capacity: 256,
            max_concurrent_positions: 8,
            shutdown_timeout_seconds: 10,
            discrepancy_escalation_passes: 3,
            max_auth_failures: 3,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    pub quantity_epsilon: Decimal,
    pub entry_price_epsilon: Decimal,
    /// Relative mark-price drift tolerated before refreshing, in percent
    pub mark_price_tolerance_pct: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            quantity_epsilon: Decimal::new(1, 9),
            entry_price_epsilon: Decimal::new(1, 8),
            mark_price_tolerance_pct: Decimal::new(1, 1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per connector call, including the first
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: 2,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub window_seconds: u64,
    pub cooldown_seconds: u64,
    pub max_cooldown_seconds: u64,
    pub cooldown_multiplier: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_seconds: 60,
            cooldown_seconds: 30,
            max_cooldown_seconds: 600,
            cooldown_multiplier: 2,
        }
    }
}

impl BreakerConfig {
    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.threshold,
            window: Duration::from_secs(self.window_seconds),
            cooldown: Duration::from_secs(self.cooldown_seconds),
            max_cooldown: Duration::from_secs(self.max_cooldown_seconds),
            cooldown_multiplier: self.cooldown_multiplier,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub kind: Venue,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub testnet: bool,
    /// REST endpoint override
    #[serde(default)]
    pub base_url: Option<String>,
    /// WebSocket endpoint override
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_secret_env: Option<String>,
    /// Account uses hedge (two-sided) position mode
    #[serde(default)]
    pub hedge_mode: bool,
    #[serde(default = "default_recv_window")]
    pub recv_window_ms: u64,
}

impl VenueConfig {
    pub fn paper() -> Self {
        Self {
            kind: Venue::Paper,
            enabled: true,
            testnet: false,
            base_url: None,
            ws_url: None,
            api_key_env: None,
            api_secret_env: None,
            hedge_mode: true,
            recv_window_ms: default_recv_window(),
        }
    }

    /// Environment variable names for credentials, with per-venue defaults
    pub fn credential_vars(&self) -> (String, String) {
        let prefix = self.kind.as_str().to_uppercase();
        (
            self.api_key_env
                .clone()
                .unwrap_or_else(|| format!("{}_API_KEY", prefix)),
            self.api_secret_env
                .clone()
                .unwrap_or_else(|| format!("{}_API_SECRET", prefix)),
        )
    }
}

fn default_true() -> bool {
    true
}

fn default_recv_window() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log files are written here when set
    #[serde(default)]
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusServerConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("ledger.backend", "memory")?
            .set_default("ledger.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("WARDEN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (WARDEN__PROTECTION__STOP_LOSS_PERCENT, etc.)
            .add_source(
                Environment::with_prefix("WARDEN")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Paper venue, in-memory ledger, library defaults
    pub fn default_config() -> Self {
        Self {
            protection: ProtectionConfig::default(),
            monitor: MonitorConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            venues: vec![VenueConfig::paper()],
            ledger: LedgerConfig::default(),
            logging: LoggingConfig::default(),
            status_server: StatusServerConfig::default(),
        }
    }

    pub fn enabled_venues(&self) -> impl Iterator<Item = &VenueConfig> {
        self.venues.iter().filter(|v| v.enabled)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(policy_errors) = self.protection.policy().validate() {
            errors.extend(policy_errors);
        }

        if self.monitor.poll_interval_seconds == 0 {
            errors.push("monitor.poll_interval_seconds must be positive".to_string());
        }
        if self.monitor.event_queue_capacity == 0 {
            errors.push("monitor.event_queue_capacity must be positive".to_string());
        }
        if self.monitor.max_concurrent_positions == 0 {
            errors.push("monitor.max_concurrent_positions must be positive".to_string());
        }
        if self.monitor.max_auth_failures == 0 {
            errors.push("monitor.max_auth_failures must be positive".to_string());
        }

        if self.reconciliation.quantity_epsilon < Decimal::ZERO
            || self.reconciliation.entry_price_epsilon < Decimal::ZERO
            || self.reconciliation.mark_price_tolerance_pct < Decimal::ZERO
        {
            errors.push("reconciliation tolerances must not be negative".to_string());
        }

        if self.retry.max_retries == 0 {
            errors.push("retry.max_retries must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.base_delay_ms must not exceed retry.max_delay_ms".to_string());
        }

        if self.circuit_breaker.threshold == 0 {
            errors.push("circuit_breaker.threshold must be positive".to_string());
        }
        if self.circuit_breaker.cooldown_seconds > self.circuit_breaker.max_cooldown_seconds {
            errors.push(
                "circuit_breaker.cooldown_seconds must not exceed max_cooldown_seconds".to_string(),
            );
        }

        if self.enabled_venues().next().is_none() {
            errors.push("at least one venue must be enabled".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for venue in self.enabled_venues() {
            if !seen.insert(venue.kind) {
                errors.push(format!("venue {} configured more than once", venue.kind));
            }
        }

        if self.ledger.backend == LedgerBackend::Postgres && self.ledger.url.is_none() {
            errors.push("ledger.url is required for the postgres backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default_config().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = AppConfig::default_config();
        config.protection.stop_loss_percent = dec!(0);
        config.monitor.poll_interval_seconds = 0;
        config.ledger.backend = LedgerBackend::Postgres;
        config.venues.push(VenueConfig::paper());

        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 4, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("ledger.url")));
        assert!(errors.iter().any(|e| e.contains("more than once")));
    }

    #[test]
    fn test_retry_config_counts_total_attempts() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_credential_var_defaults() {
        let mut venue = VenueConfig::paper();
        venue.kind = Venue::Bybit;
        assert_eq!(
            venue.credential_vars(),
            ("BYBIT_API_KEY".to_string(), "BYBIT_API_SECRET".to_string())
        );
    }

    #[test]
    fn test_load_from_missing_dir_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent-warden-config").unwrap();
        assert_eq!(config.monitor.poll_interval_seconds, 30);
        assert_eq!(config.protection.stop_loss_percent, dec!(6.5));
        assert!(config.venues.is_empty());
    }
}
