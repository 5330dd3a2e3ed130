//! Protective-order state machine
//!
//! [`plan`] is pure: given a position, its ledger orders and the policy, it
//! returns the ordered venue actions still needed and the protection level
//! the orders currently provide. Actions are ordered stop-loss first, then
//! trailing stop and take-profit; the executor stops short of the later ones
//! when the stop-loss does not settle.

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    OrderKind, OrderStatus, Position, ProtectionPolicy, ProtectionStatus, ProtectiveOrder,
    ProtectiveOrderSpec, Trigger,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProtectionAction {
    /// Cancel an ACTIVE order whose size no longer matches the position
    Supersede {
        order_id: Uuid,
        kind: OrderKind,
        venue_order_id: String,
    },
    Place(ProtectiveOrderSpec),
}

impl ProtectionAction {
    pub fn kind(&self) -> OrderKind {
        match self {
            ProtectionAction::Supersede { kind, .. } => *kind,
            ProtectionAction::Place(spec) => spec.kind,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ProtectionAction::Supersede { kind, .. } => format!("CANCEL {}", kind),
            ProtectionAction::Place(spec) => format!("PLACE {}", spec.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionPlan {
    pub actions: Vec<ProtectionAction>,
    /// Level provided by the orders as they stand
    pub status: ProtectionStatus,
}

impl ProtectionPlan {
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Most recent non-cancelled order of a kind
fn latest<'a>(orders: &'a [ProtectiveOrder], kind: OrderKind) -> Option<&'a ProtectiveOrder> {
    orders
        .iter()
        .filter(|o| o.kind == kind && o.status != OrderStatus::Cancelled && o.status != OrderStatus::Filled)
        .max_by_key(|o| (o.status == OrderStatus::Active, o.updated_at))
}

fn active<'a>(orders: &'a [ProtectiveOrder], kind: OrderKind) -> Option<&'a ProtectiveOrder> {
    orders.iter().find(|o| o.kind == kind && o.is_active())
}

/// Protection level provided by a set of orders
pub fn assess(orders: &[ProtectiveOrder], policy: &ProtectionPolicy) -> ProtectionStatus {
    if active(orders, OrderKind::StopLoss).is_none() {
        return match latest(orders, OrderKind::StopLoss) {
            Some(o) if o.status == OrderStatus::Pending => ProtectionStatus::StopLossPending,
            _ => ProtectionStatus::Unprotected,
        };
    }

    if !policy.trailing_enabled() {
        return ProtectionStatus::FullyProtected;
    }

    match latest(orders, OrderKind::TrailingStop).map(|o| o.status) {
        Some(OrderStatus::Active) => ProtectionStatus::FullyProtected,
        Some(OrderStatus::Rejected) => ProtectionStatus::PartiallyProtected,
        Some(OrderStatus::Pending) => ProtectionStatus::TrailingPending,
        _ => ProtectionStatus::StopLossActive,
    }
}

/// Decide the venue actions an OPEN position still needs
pub fn plan(
    position: &Position,
    orders: &[ProtectiveOrder],
    policy: &ProtectionPolicy,
    mark_price: Option<Decimal>,
) -> ProtectionPlan {
    let status = assess(orders, policy);
    if !position.is_open() || !policy.mandatory {
        return ProtectionPlan {
            actions: Vec::new(),
            status,
        };
    }

    let mut actions = Vec::new();
    let stop = Trigger::Fixed {
        trigger_price: policy.stop_loss_price(position.side, position.entry_price),
    };
    require(position, orders, OrderKind::StopLoss, stop, &mut actions);

    if policy.trailing_enabled() {
        let trailing = Trigger::Trailing {
            activation_price: policy.trailing_activation_price(
                position.side,
                position.entry_price,
                mark_price,
            ),
            callback_rate: policy.trailing_callback_rate,
        };
        require(position, orders, OrderKind::TrailingStop, trailing, &mut actions);
    }

    if let Some(trigger_price) = policy.take_profit_price(position.side, position.entry_price) {
        require(
            position,
            orders,
            OrderKind::TakeProfit,
            Trigger::Fixed { trigger_price },
            &mut actions,
        );
    }

    ProtectionPlan { actions, status }
}

fn require(
    position: &Position,
    orders: &[ProtectiveOrder],
    kind: OrderKind,
    trigger: Trigger,
    actions: &mut Vec<ProtectionAction>,
) {
    if let Some(existing) = active(orders, kind) {
        if existing.quantity == position.quantity {
            return;
        }
        if let Some(venue_order_id) = &existing.venue_order_id {
            actions.push(ProtectionAction::Supersede {
                order_id: existing.id,
                kind,
                venue_order_id: venue_order_id.clone(),
            });
        }
    }

    actions.push(ProtectionAction::Place(ProtectiveOrderSpec::new(
        position.venue,
        position.symbol.clone(),
        position.side,
        kind,
        trigger,
        position.quantity,
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderHandle, RemotePosition, Side, Venue};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn position(side: Side, qty: Decimal, entry: Decimal) -> Position {
        Position::seed_from_remote(
            &RemotePosition {
                venue: Venue::Binance,
                symbol: "ETHUSDT".into(),
                side,
                quantity: qty,
                entry_price: entry,
                mark_price: entry,
                leverage: 10,
                opened_at: None,
            },
            Utc::now(),
        )
    }

    fn active_order(position: &Position, spec: &ProtectiveOrderSpec) -> ProtectiveOrder {
        let mut order = ProtectiveOrder::pending(position.id, spec, Utc::now());
        order.mark_active(
            &OrderHandle {
                venue_order_id: format!("v-{}", spec.kind),
                client_order_id: spec.idempotency_key.clone(),
                status: OrderStatus::Active,
                trigger: spec.trigger,
                quantity: spec.quantity,
            },
            Utc::now(),
        );
        order
    }

    fn spec_of(action: &ProtectionAction) -> &ProtectiveOrderSpec {
        match action {
            ProtectionAction::Place(spec) => spec,
            other => panic!("expected placement, got {:?}", other),
        }
    }

    #[test]
    fn unprotected_short_gets_stop_then_trailing() {
        let pos = position(Side::Short, dec!(2), dec!(4000));
        let plan = plan(&pos, &[], &ProtectionPolicy::default(), None);

        assert_eq!(plan.status, ProtectionStatus::Unprotected);
        assert_eq!(plan.actions.len(), 2);
        let stop = spec_of(&plan.actions[0]);
        assert_eq!(stop.kind, OrderKind::StopLoss);
        assert_eq!(stop.trigger, Trigger::Fixed { trigger_price: dec!(4260) });
        assert_eq!(spec_of(&plan.actions[1]).kind, OrderKind::TrailingStop);
    }

    #[test]
    fn fully_protected_position_needs_nothing() {
        let pos = position(Side::Long, dec!(1), dec!(100000));
        let policy = ProtectionPolicy::default();
        let first = plan(&pos, &[], &policy, None);
        let orders: Vec<_> = first
            .actions
            .iter()
            .map(|a| active_order(&pos, spec_of(a)))
            .collect();

        let second = plan(&pos, &orders, &policy, None);
        assert!(second.is_noop());
        assert_eq!(second.status, ProtectionStatus::FullyProtected);
    }

    #[test]
    fn rejected_trailing_with_active_stop_is_partial() {
        let pos = position(Side::Long, dec!(1), dec!(100000));
        let policy = ProtectionPolicy::default();
        let first = plan(&pos, &[], &policy, None);

        let stop = active_order(&pos, spec_of(&first.actions[0]));
        let mut trailing = ProtectiveOrder::pending(pos.id, spec_of(&first.actions[1]), Utc::now());
        trailing.mark_rejected("callback rate out of range", Utc::now());

        let next = plan(&pos, &[stop, trailing], &policy, None);
        assert_eq!(next.status, ProtectionStatus::PartiallyProtected);
        // Retried every cycle
        assert_eq!(next.actions.len(), 1);
        assert_eq!(next.actions[0].kind(), OrderKind::TrailingStop);
    }

    #[test]
    fn position_in_profit_arms_trailing_just_past_the_mark() {
        let pos = position(Side::Long, dec!(1), dec!(100000));
        let policy = ProtectionPolicy::default();

        let plan = plan(&pos, &[], &policy, Some(dec!(105000)));
        assert_eq!(
            spec_of(&plan.actions[1]).trigger,
            Trigger::Trailing {
                activation_price: dec!(105010.5),
                callback_rate: dec!(0.5),
            }
        );

        let short = position(Side::Short, dec!(2), dec!(4000));
        let plan = super::plan(&short, &[], &policy, Some(dec!(4010)));
        assert_eq!(
            spec_of(&plan.actions[1]).trigger,
            Trigger::Trailing {
                activation_price: dec!(3880),
                callback_rate: dec!(0.5),
            }
        );
    }

    #[test]
    fn resized_position_supersedes_stop() {
        let mut pos = position(Side::Long, dec!(0.5), dec!(100000));
        let policy = ProtectionPolicy {
            trailing_callback_rate: Decimal::ZERO,
            ..ProtectionPolicy::default()
        };
        let first = plan(&pos, &[], &policy, None);
        let stop = active_order(&pos, spec_of(&first.actions[0]));

        pos.quantity = dec!(0.6);
        let next = plan(&pos, &[stop], &policy, None);
        assert_eq!(next.status, ProtectionStatus::FullyProtected);
        assert!(matches!(next.actions[0], ProtectionAction::Supersede { .. }));
        assert_eq!(spec_of(&next.actions[1]).quantity, dec!(0.6));
    }

    #[test]
    fn observe_only_policy_plans_nothing() {
        let pos = position(Side::Long, dec!(1), dec!(100000));
        let policy = ProtectionPolicy {
            mandatory: false,
            ..ProtectionPolicy::default()
        };
        let plan = plan(&pos, &[], &policy, None);
        assert!(plan.is_noop());
        assert_eq!(plan.status, ProtectionStatus::Unprotected);
    }

    #[test]
    fn take_profit_follows_trailing() {
        let pos = position(Side::Long, dec!(1), dec!(100));
        let policy = ProtectionPolicy {
            take_profit_percent: Some(dec!(10)),
            ..ProtectionPolicy::default()
        };
        let plan = plan(&pos, &[], &policy, None);
        let kinds: Vec<_> = plan.actions.iter().map(|a| a.kind()).collect();
        assert_eq!(
            kinds,
            vec![OrderKind::StopLoss, OrderKind::TrailingStop, OrderKind::TakeProfit]
        );
        assert_eq!(
            spec_of(&plan.actions[2]).trigger,
            Trigger::Fixed { trigger_price: dec!(110) }
        );
    }

    #[test]
    fn pending_stop_assesses_as_pending() {
        let pos = position(Side::Long, dec!(1), dec!(100000));
        let policy = ProtectionPolicy::default();
        let first = plan(&pos, &[], &policy, None);
        let pending = ProtectiveOrder::pending(pos.id, spec_of(&first.actions[0]), Utc::now());
        assert_eq!(assess(&[pending], &policy), ProtectionStatus::StopLossPending);
    }
}
