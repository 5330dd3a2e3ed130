//! Alert escalation for a venue loop
//!
//! Routine failures are retried quietly. Two conditions escalate:
//! an open position left without complete protection past the grace period,
//! and a discrepancy that keeps reappearing for several passes.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{Position, PositionKey, ProtectionStatus};
use crate::reconciliation::{Discrepancy, DiscrepancyTracker};
use crate::supervisor::alert_manager::{discrepancy_alert_key, protection_alert_key};
use crate::supervisor::AlertManager;

/// Settled protection levels; anything else counts toward the grace period
pub fn is_settled(status: ProtectionStatus) -> bool {
    matches!(
        status,
        ProtectionStatus::FullyProtected | ProtectionStatus::PartiallyProtected
    )
}

struct Shortfall {
    key: PositionKey,
    cycles: u32,
}

pub struct Escalator {
    alerts: Arc<AlertManager>,
    grace_cycles: u32,
    mandatory: bool,
    shortfalls: HashMap<Uuid, Shortfall>,
    discrepancies: DiscrepancyTracker,
}

impl Escalator {
    pub fn new(
        alerts: Arc<AlertManager>,
        grace_cycles: u32,
        escalation_passes: u32,
        mandatory: bool,
    ) -> Self {
        Self {
            alerts,
            grace_cycles,
            mandatory,
            shortfalls: HashMap::new(),
            discrepancies: DiscrepancyTracker::new(escalation_passes),
        }
    }

    /// Observe the discrepancies of one full pass
    pub async fn observe_discrepancies(&mut self, found: &[Discrepancy]) {
        let update = self.discrepancies.observe(found);
        for escalation in update.escalations {
            self.alerts
                .discrepancy_unresolved(&escalation.key, escalation.kind.as_str(), escalation.passes)
                .await;
        }
        for key in update.resolved {
            self.alerts.resolve(&discrepancy_alert_key(&key)).await;
        }
    }

    /// Observe the committed state of every open position on the venue.
    /// Returns the number of positions currently in violation.
    pub async fn observe_protection(&mut self, open: &[Position]) -> usize {
        if !self.mandatory {
            return 0;
        }

        let mut still_short: HashMap<Uuid, Shortfall> = HashMap::new();
        let mut violations = 0;

        for position in open {
            if is_settled(position.protection_status) {
                continue;
            }
            let cycles = self
                .shortfalls
                .get(&position.id)
                .map_or(0, |s| s.cycles)
                + 1;
            if cycles > self.grace_cycles {
                violations += 1;
                self.alerts
                    .protection_violated(&position.key(), cycles, position.protection_status.as_str())
                    .await;
            }
            still_short.insert(
                position.id,
                Shortfall {
                    key: position.key(),
                    cycles,
                },
            );
        }

        // Protected or closed since last pass
        for (id, shortfall) in &self.shortfalls {
            if !still_short.contains_key(id) {
                self.alerts.resolve(&protection_alert_key(&shortfall.key)).await;
            }
        }

        self.shortfalls = still_short;
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RemotePosition, Side, Venue};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn unprotected() -> Position {
        Position::seed_from_remote(
            &RemotePosition {
                venue: Venue::Binance,
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                quantity: dec!(1),
                entry_price: dec!(100000),
                mark_price: dec!(100000),
                leverage: 10,
                opened_at: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn alerts_only_after_grace_period() {
        let alerts = Arc::new(AlertManager::with_defaults());
        let mut escalator = Escalator::new(alerts.clone(), 2, 3, true);
        let mut position = unprotected();
        let key = protection_alert_key(&position.key());

        assert_eq!(escalator.observe_protection(&[position.clone()]).await, 0);
        assert_eq!(escalator.observe_protection(&[position.clone()]).await, 0);
        assert!(!alerts.is_active(&key).await);
        assert_eq!(escalator.observe_protection(&[position.clone()]).await, 1);
        assert!(alerts.is_active(&key).await);

        position.protection_status = ProtectionStatus::PartiallyProtected;
        assert_eq!(escalator.observe_protection(&[position]).await, 0);
        assert!(!alerts.is_active(&key).await);
    }

    #[tokio::test]
    async fn observe_only_mode_never_alerts() {
        let alerts = Arc::new(AlertManager::with_defaults());
        let mut escalator = Escalator::new(alerts.clone(), 0, 3, false);
        assert_eq!(escalator.observe_protection(&[unprotected()]).await, 0);
        assert!(alerts.active_alerts().await.is_empty());
    }
}
