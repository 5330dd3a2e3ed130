//! Executes protection plans against a venue
//!
//! The only place protective orders are placed. Actions for one position run
//! strictly in order; a failed stop-loss ends the sequence so the trailing
//! stop is never placed on an unprotected position.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::state_machine::{assess, ProtectionAction, ProtectionPlan};
use crate::domain::{
    OrderKind, OrderStatus, Position, PositionKey, ProtectionPolicy, ProtectionStatus,
    ProtectiveOrder,
};
use crate::error::{ConnectorError, FailureKind};
use crate::exchange::VenueConnector;

/// Structured record of one failed protective-order call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionFailure {
    pub key: PositionKey,
    pub action: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtectionOutcome {
    pub key: PositionKey,
    pub position_id: uuid::Uuid,
    pub previous: ProtectionStatus,
    pub status: ProtectionStatus,
    /// Order records created or modified, for the pass commit
    pub orders: Vec<ProtectiveOrder>,
    pub failures: Vec<ProtectionFailure>,
}

impl ProtectionOutcome {
    pub fn auth_failed(&self) -> bool {
        self.failures.iter().any(|f| f.kind == FailureKind::AuthFailure)
    }

    pub fn status_changed(&self) -> bool {
        self.previous != self.status
    }
}

pub struct ProtectionExecutor {
    connector: Arc<dyn VenueConnector>,
    policy: ProtectionPolicy,
}

impl ProtectionExecutor {
    pub fn new(connector: Arc<dyn VenueConnector>, policy: ProtectionPolicy) -> Self {
        Self { connector, policy }
    }

    pub fn policy(&self) -> &ProtectionPolicy {
        &self.policy
    }

    pub async fn execute(
        &self,
        position: &Position,
        mut orders: Vec<ProtectiveOrder>,
        plan: ProtectionPlan,
        now: DateTime<Utc>,
    ) -> ProtectionOutcome {
        let key = position.key();
        let mut touched: Vec<ProtectiveOrder> = Vec::new();
        let mut failures = Vec::new();

        for action in plan.actions {
            match &action {
                ProtectionAction::Supersede {
                    order_id,
                    venue_order_id,
                    kind,
                } => match self.connector.cancel_order(&position.symbol, venue_order_id).await {
                    Ok(_) => {
                        if let Some(order) = orders.iter_mut().find(|o| o.id == *order_id) {
                            order.transition(OrderStatus::Cancelled, now);
                            touched.push(order.clone());
                        }
                        info!(%key, kind = %kind, venue_order_id, "Superseded protective order cancelled");
                    }
                    Err(err) => {
                        failures.push(self.failure(&key, &action, &err));
                        break;
                    }
                },
                ProtectionAction::Place(spec) => {
                    if spec.kind != OrderKind::StopLoss && !has_active_stop(&orders) {
                        debug!(%key, kind = %spec.kind, "Skipping placement until stop-loss is active");
                        continue;
                    }

                    // Reuse the record of an earlier unconfirmed or rejected attempt
                    let position_in_list = orders.iter().position(|o| {
                        o.idempotency_key == spec.idempotency_key
                            && matches!(o.status, OrderStatus::Pending | OrderStatus::Rejected)
                    });
                    let mut record = match position_in_list {
                        Some(idx) => orders.remove(idx),
                        None => ProtectiveOrder::pending(position.id, spec, now),
                    };
                    record.quantity = spec.quantity;
                    record.trigger = spec.trigger;

                    let stop_failed = match self.connector.place_protective_order(spec).await {
                        Ok(handle) => {
                            record.mark_active(&handle, now);
                            info!(
                                %key,
                                kind = %spec.kind,
                                venue_order_id = %handle.venue_order_id,
                                trigger = %spec.trigger.reference_price(),
                                "Protective order active"
                            );
                            false
                        }
                        Err(err) => {
                            if let ConnectorError::VenueRejected { reason, .. } = &err {
                                record.mark_rejected(reason.clone(), now);
                            } else {
                                record.transition(OrderStatus::Pending, now);
                            }
                            failures.push(self.failure(&key, &action, &err));
                            spec.kind == OrderKind::StopLoss
                        }
                    };

                    orders.push(record.clone());
                    touched.push(record);
                    if stop_failed {
                        break;
                    }
                }
            }
        }

        ProtectionOutcome {
            key,
            position_id: position.id,
            previous: position.protection_status,
            status: assess(&orders, &self.policy),
            orders: touched,
            failures,
        }
    }

    fn failure(
        &self,
        key: &PositionKey,
        action: &ProtectionAction,
        err: &ConnectorError,
    ) -> ProtectionFailure {
        let failure = ProtectionFailure {
            key: key.clone(),
            action: action.describe(),
            kind: err.kind(),
            message: err.to_string(),
        };
        warn!(
            venue = %key.venue,
            symbol = %key.symbol,
            side = %key.side,
            action = %failure.action,
            failure_kind = %failure.kind,
            "Protective order call failed: {}",
            failure.message
        );
        failure
    }
}

fn has_active_stop(orders: &[ProtectiveOrder]) -> bool {
    orders
        .iter()
        .any(|o| o.kind == OrderKind::StopLoss && o.is_active())
}
