//! Alert Manager
//!
//! Routes alerts by severity to the log and to in-process subscribers, keeps
//! the set of currently active alerts for operator queries, and rate limits
//! repeats to prevent alert storms.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::domain::PositionKey;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational - log only
    Info,
    /// Warning - degraded but self-healing (breaker open)
    Warning,
    /// Error - needs attention (unresolved discrepancy)
    Error,
    /// Critical - operator action required (unprotected position, halted venue)
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    /// Identity used for deduplication and resolution
    pub key: String,
    pub title: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            key: format!("{}:{}", component, title),
            title: title.to_string(),
            message: message.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Configuration for alert manager
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    /// Minimum interval between repeated log lines for one alert key
    pub rate_limit_secs: u64,
    /// Maximum alerts per minute before throttling
    pub max_alerts_per_minute: u32,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            max_alerts_per_minute: 30,
        }
    }
}

/// Rate limiter state for an alert key
#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

/// Alert keys derived from position identity
pub fn protection_alert_key(key: &PositionKey) -> String {
    format!("protection:{}", key)
}

pub fn discrepancy_alert_key(key: &PositionKey) -> String {
    format!("discrepancy:{}", key)
}

pub struct AlertManager {
    config: AlertManagerConfig,
    rate_limits: Arc<RwLock<HashMap<String, RateLimitState>>>,
    alerts_this_minute: Arc<RwLock<Vec<DateTime<Utc>>>>,
    active: Arc<RwLock<HashMap<String, Alert>>>,
    event_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            config,
            rate_limits: Arc::new(RwLock::new(HashMap::new())),
            alerts_this_minute: Arc::new(RwLock::new(Vec::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    /// Subscribe to alerts
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        let now = Utc::now();
        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&alert.key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds() as u64;
            if elapsed < self.config.rate_limit_secs {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    alert.key, state.suppressed_count
                );
                return true;
            }

            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                alert.key.clone(),
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }

        false
    }

    async fn is_throttled(&self) -> bool {
        let now = Utc::now();
        let minute_ago = now - chrono::Duration::minutes(1);

        let mut alerts = self.alerts_this_minute.write().await;
        alerts.retain(|t| *t > minute_ago);

        if alerts.len() >= self.config.max_alerts_per_minute as usize {
            warn!(
                "Alert throttling: {} alerts in last minute (max: {})",
                alerts.len(),
                self.config.max_alerts_per_minute
            );
            return true;
        }

        alerts.push(now);
        false
    }

    /// Raise an alert. Non-info alerts stay active until resolved.
    pub async fn alert(&self, alert: Alert) {
        let _ = self.event_tx.send(alert.clone());

        if alert.level > AlertLevel::Info {
            self.active
                .write()
                .await
                .insert(alert.key.clone(), alert.clone());
        }

        if self.should_rate_limit(&alert).await || self.is_throttled().await {
            return;
        }

        match alert.level {
            AlertLevel::Info => info!(alert_key = %alert.key, "[{}] {}: {}", alert.component, alert.title, alert.message),
            AlertLevel::Warning => {
                warn!(alert_key = %alert.key, "[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Error => {
                error!(alert_key = %alert.key, "[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Critical => {
                error!(
                    alert_key = %alert.key,
                    "CRITICAL [{}] {}: {}",
                    alert.component, alert.title, alert.message
                )
            }
        }
    }

    /// Clear an active alert; returns whether it was active
    pub async fn resolve(&self, key: &str) -> bool {
        let removed = self.active.write().await.remove(key);
        if let Some(alert) = &removed {
            info!(alert_key = %key, "Alert resolved: {}", alert.title);
            self.rate_limits.write().await.remove(key);
        }
        removed.is_some()
    }

    pub async fn is_active(&self, key: &str) -> bool {
        self.active.read().await.contains_key(key)
    }

    /// Active alerts, most severe first
    pub async fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.read().await.values().cloned().collect();
        alerts.sort_by(|a, b| b.level.cmp(&a.level).then(a.timestamp.cmp(&b.timestamp)));
        alerts
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Info, component, title, message))
            .await;
    }

    /// Position still lacks an active stop-loss after the grace period
    pub async fn protection_violated(&self, key: &PositionKey, cycles: u32, reason: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "protection_monitor",
                "Mandatory Protection Violated",
                &format!(
                    "{} has no active stop-loss after {} cycles: {}",
                    key, cycles, reason
                ),
            )
            .with_key(protection_alert_key(key))
            .with_metadata(serde_json::json!({
                "venue": key.venue.as_str(),
                "symbol": key.symbol,
                "side": key.side.as_str(),
                "cycles": cycles,
            })),
        )
        .await;
    }

    pub async fn discrepancy_unresolved(&self, key: &PositionKey, kind: &str, passes: u32) {
        self.alert(
            Alert::new(
                AlertLevel::Error,
                "reconciliation",
                "Discrepancy Unresolved",
                &format!("{} {} persisted for {} passes", key, kind, passes),
            )
            .with_key(discrepancy_alert_key(key))
            .with_metadata(serde_json::json!({
                "kind": kind,
                "passes": passes,
            })),
        )
        .await;
    }

    pub async fn venue_halted(&self, venue: &str, reason: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "protection_monitor",
                "Venue Loop Halted",
                &format!("{} halted: {}", venue, reason),
            )
            .with_key(format!("halted:{}", venue))
            .with_metadata(serde_json::json!({
                "action": "manual_intervention_required",
                "venue": venue,
            })),
        )
        .await;
    }

    pub async fn circuit_breaker_opened(&self, venue: &str, reason: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Warning,
                "circuit_breaker",
                "Circuit Breaker Opened",
                &format!("{}: {}", venue, reason),
            )
            .with_key(format!("breaker:{}", venue)),
        )
        .await;
    }

    /// Suppressed counts keyed by alert key
    pub async fn get_suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, Venue};

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Info < AlertLevel::Warning);
        assert!(AlertLevel::Warning < AlertLevel::Error);
        assert!(AlertLevel::Error < AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_rate_limiting() {
        let manager = AlertManager::with_defaults();
        let alert = Alert::new(AlertLevel::Warning, "test", "Test", "Message");

        assert!(!manager.should_rate_limit(&alert).await);
        assert!(manager.should_rate_limit(&alert).await);
    }

    #[tokio::test]
    async fn test_active_alert_lifecycle() {
        let manager = AlertManager::with_defaults();
        let mut rx = manager.subscribe();
        let key = PositionKey::new(Venue::Binance, "BTCUSDT", Side::Long);

        manager.protection_violated(&key, 2, "stop rejected").await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.level, AlertLevel::Critical);
        assert!(manager.is_active(&protection_alert_key(&key)).await);

        assert!(manager.resolve(&protection_alert_key(&key)).await);
        assert!(!manager.is_active(&protection_alert_key(&key)).await);
        assert!(!manager.resolve(&protection_alert_key(&key)).await);
    }

    #[tokio::test]
    async fn test_info_alerts_are_not_active() {
        let manager = AlertManager::with_defaults();
        manager.info("test", "Hello", "world").await;
        assert!(manager.active_alerts().await.is_empty());
    }
}
