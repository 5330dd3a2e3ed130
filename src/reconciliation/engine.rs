//! Ledger vs. venue diff
//!
//! Full outer join of local OPEN positions and venue-reported positions on
//! (venue, symbol, side). The venue is always authoritative: every
//! divergence becomes an action that moves the ledger toward it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::ReconciliationConfig;
use crate::domain::{Position, PositionKey, PositionStatus, RemotePosition};
use crate::error::WardenError;

/// Thresholds below which differences are treated as rounding noise
#[derive(Debug, Clone)]
pub struct Tolerances {
    pub quantity_epsilon: Decimal,
    pub entry_price_epsilon: Decimal,
    /// Relative mark-price drift, in percent of the venue mark
    pub mark_price_tolerance_pct: Decimal,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self::from(&ReconciliationConfig::default())
    }
}

impl From<&ReconciliationConfig> for Tolerances {
    fn from(config: &ReconciliationConfig) -> Self {
        Self {
            quantity_epsilon: config.quantity_epsilon,
            entry_price_epsilon: config.entry_price_epsilon,
            mark_price_tolerance_pct: config.mark_price_tolerance_pct,
        }
    }
}

/// Ledger mutation derived from one pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileAction {
    /// Venue-only position; seeded UNPROTECTED
    CreateLocal { position: Position },
    CloseLocal {
        position_id: Uuid,
        key: PositionKey,
        closed_at: DateTime<Utc>,
    },
    UpdateLocal {
        position_id: Uuid,
        key: PositionKey,
        quantity: Decimal,
        entry_price: Decimal,
        mark_price: Decimal,
        leverage: u32,
    },
}

impl ReconcileAction {
    pub fn key(&self) -> PositionKey {
        match self {
            ReconcileAction::CreateLocal { position } => position.key(),
            ReconcileAction::CloseLocal { key, .. } | ReconcileAction::UpdateLocal { key, .. } => {
                key.clone()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReconcileAction::CreateLocal { .. } => "CREATE_LOCAL",
            ReconcileAction::CloseLocal { .. } => "CLOSE_LOCAL",
            ReconcileAction::UpdateLocal { .. } => "UPDATE_LOCAL",
        }
    }

    /// Apply to a ledger record. `CreateLocal` has no existing record.
    pub fn apply_to(&self, position: &mut Position, now: DateTime<Utc>) {
        match self {
            ReconcileAction::CreateLocal { .. } => {}
            ReconcileAction::CloseLocal { closed_at, .. } => {
                position.status = PositionStatus::Closed;
                position.closed_at = Some(*closed_at);
                position.last_synced_at = now;
            }
            ReconcileAction::UpdateLocal {
                quantity,
                entry_price,
                mark_price,
                leverage,
                ..
            } => {
                position.quantity = *quantity;
                position.entry_price = *entry_price;
                position.mark_price = *mark_price;
                position.leverage = *leverage;
                position.last_synced_at = now;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    OrphanLocal,
    OrphanRemote,
    QuantityMismatch,
    PriceMismatch,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::OrphanLocal => "ORPHAN_LOCAL",
            DiscrepancyKind::OrphanRemote => "ORPHAN_REMOTE",
            DiscrepancyKind::QuantityMismatch => "QUANTITY_MISMATCH",
            DiscrepancyKind::PriceMismatch => "PRICE_MISMATCH",
        }
    }

    /// Price drift is routine and never escalates
    pub fn escalates(&self) -> bool {
        !matches!(self, DiscrepancyKind::PriceMismatch)
    }
}

impl TryFrom<&str> for DiscrepancyKind {
    type Error = WardenError;

    fn try_from(s: &str) -> crate::error::Result<Self> {
        match s {
            "ORPHAN_LOCAL" => Ok(DiscrepancyKind::OrphanLocal),
            "ORPHAN_REMOTE" => Ok(DiscrepancyKind::OrphanRemote),
            "QUANTITY_MISMATCH" => Ok(DiscrepancyKind::QuantityMismatch),
            "PRICE_MISMATCH" => Ok(DiscrepancyKind::PriceMismatch),
            other => Err(WardenError::InvalidState(format!(
                "unknown discrepancy kind: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub key: PositionKey,
    pub local_value: Option<Decimal>,
    pub remote_value: Option<Decimal>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub actions: Vec<ReconcileAction>,
    pub discrepancies: Vec<Discrepancy>,
    /// Matched positions that need no change; only their sync time moves
    pub synced: Vec<Uuid>,
}

impl ReconcileOutcome {
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }

    /// Every key the pass reads or writes
    pub fn touched_keys(&self) -> BTreeSet<PositionKey> {
        self.actions.iter().map(|a| a.key()).collect()
    }
}

/// Diff local OPEN positions against the venue snapshot
pub fn reconcile(
    local: &[Position],
    remote: &[RemotePosition],
    tolerances: &Tolerances,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let local_by_key: BTreeMap<PositionKey, &Position> = local
        .iter()
        .filter(|p| p.is_open())
        .map(|p| (p.key(), p))
        .collect();
    let remote_by_key: BTreeMap<PositionKey, &RemotePosition> = remote
        .iter()
        .filter(|r| !r.quantity.is_zero())
        .map(|r| (r.key(), r))
        .collect();

    let keys: BTreeSet<&PositionKey> = local_by_key.keys().chain(remote_by_key.keys()).collect();
    let mut outcome = ReconcileOutcome::default();

    for key in keys {
        match (local_by_key.get(key), remote_by_key.get(key)) {
            (None, Some(remote)) => {
                outcome.discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::OrphanRemote,
                    key: key.clone(),
                    local_value: None,
                    remote_value: Some(remote.quantity),
                    detected_at: now,
                });
                outcome.actions.push(ReconcileAction::CreateLocal {
                    position: Position::seed_from_remote(remote, now),
                });
            }
            (Some(local), None) => {
                outcome.discrepancies.push(Discrepancy {
                    kind: DiscrepancyKind::OrphanLocal,
                    key: key.clone(),
                    local_value: Some(local.quantity),
                    remote_value: None,
                    detected_at: now,
                });
                outcome.actions.push(ReconcileAction::CloseLocal {
                    position_id: local.id,
                    key: key.clone(),
                    closed_at: now,
                });
            }
            (Some(local), Some(remote)) => {
                compare_matched(local, remote, tolerances, now, &mut outcome);
            }
            (None, None) => {}
        }
    }

    outcome
}

/// Like [`reconcile`], restricted to the given keys on both sides
pub fn reconcile_scoped(
    local: &[Position],
    remote: &[RemotePosition],
    scope: &BTreeSet<PositionKey>,
    tolerances: &Tolerances,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let local: Vec<Position> = local
        .iter()
        .filter(|p| scope.contains(&p.key()))
        .cloned()
        .collect();
    let remote: Vec<RemotePosition> = remote
        .iter()
        .filter(|r| scope.contains(&r.key()))
        .cloned()
        .collect();
    reconcile(&local, &remote, tolerances, now)
}

fn compare_matched(
    local: &Position,
    remote: &RemotePosition,
    tolerances: &Tolerances,
    now: DateTime<Utc>,
    outcome: &mut ReconcileOutcome,
) {
    let key = local.key();
    let mut changed = false;

    if (local.quantity - remote.quantity).abs() > tolerances.quantity_epsilon {
        outcome.discrepancies.push(Discrepancy {
            kind: DiscrepancyKind::QuantityMismatch,
            key: key.clone(),
            local_value: Some(local.quantity),
            remote_value: Some(remote.quantity),
            detected_at: now,
        });
        changed = true;
    }

    if (local.entry_price - remote.entry_price).abs() > tolerances.entry_price_epsilon {
        outcome.discrepancies.push(Discrepancy {
            kind: DiscrepancyKind::PriceMismatch,
            key: key.clone(),
            local_value: Some(local.entry_price),
            remote_value: Some(remote.entry_price),
            detected_at: now,
        });
        changed = true;
    } else if mark_drifted(local.mark_price, remote.mark_price, tolerances) {
        outcome.discrepancies.push(Discrepancy {
            kind: DiscrepancyKind::PriceMismatch,
            key: key.clone(),
            local_value: Some(local.mark_price),
            remote_value: Some(remote.mark_price),
            detected_at: now,
        });
        changed = true;
    }

    if changed {
        // Venues that omit leverage report 0; keep what the ledger knows
        let leverage = if remote.leverage == 0 {
            local.leverage
        } else {
            remote.leverage
        };
        outcome.actions.push(ReconcileAction::UpdateLocal {
            position_id: local.id,
            key,
            quantity: remote.quantity,
            entry_price: remote.entry_price,
            mark_price: remote.mark_price,
            leverage,
        });
    } else {
        outcome.synced.push(local.id);
    }
}

fn mark_drifted(local: Decimal, remote: Decimal, tolerances: &Tolerances) -> bool {
    if remote.is_zero() {
        return false;
    }
    let drift_pct = ((local - remote).abs() / remote.abs()) * Decimal::ONE_HUNDRED;
    drift_pct > tolerances.mark_price_tolerance_pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, Venue};
    use rust_decimal_macros::dec;

    fn remote(symbol: &str, side: Side, qty: Decimal, entry: Decimal) -> RemotePosition {
        RemotePosition {
            venue: Venue::Binance,
            symbol: symbol.to_string(),
            side,
            quantity: qty,
            entry_price: entry,
            mark_price: entry,
            leverage: 10,
            opened_at: None,
        }
    }

    fn local(symbol: &str, side: Side, qty: Decimal, entry: Decimal) -> Position {
        Position::seed_from_remote(&remote(symbol, side, qty, entry), Utc::now())
    }

    /// Apply an outcome to a plain vector, as the ledger would
    fn apply(ledger: &mut Vec<Position>, outcome: &ReconcileOutcome) {
        let now = Utc::now();
        for action in &outcome.actions {
            match action {
                ReconcileAction::CreateLocal { position } => ledger.push(position.clone()),
                ReconcileAction::CloseLocal { position_id, .. }
                | ReconcileAction::UpdateLocal { position_id, .. } => {
                    if let Some(p) = ledger.iter_mut().find(|p| p.id == *position_id) {
                        action.apply_to(p, now);
                    }
                }
            }
        }
    }

    #[test]
    fn quantity_change_updates_local() {
        let ledger = vec![local("BTCUSDT", Side::Long, dec!(0.5), dec!(100000))];
        let venue = vec![remote("BTCUSDT", Side::Long, dec!(0.6), dec!(100000))];

        let outcome = reconcile(&ledger, &venue, &Tolerances::default(), Utc::now());
        assert_eq!(outcome.actions.len(), 1);
        assert!(matches!(
            outcome.actions[0],
            ReconcileAction::UpdateLocal { quantity, .. } if quantity == dec!(0.6)
        ));
        assert_eq!(outcome.discrepancies[0].kind, DiscrepancyKind::QuantityMismatch);
    }

    #[test]
    fn epsilon_separates_noise_from_change() {
        let ledger = vec![local("BTCUSDT", Side::Long, dec!(0.5), dec!(100000))];
        let tolerances = Tolerances::default();

        let noise = vec![remote("BTCUSDT", Side::Long, dec!(0.5000000000001), dec!(100000))];
        assert!(reconcile(&ledger, &noise, &tolerances, Utc::now()).is_clean());

        let real = vec![remote("BTCUSDT", Side::Long, dec!(0.500001), dec!(100000))];
        assert_eq!(reconcile(&ledger, &real, &tolerances, Utc::now()).actions.len(), 1);
    }

    #[test]
    fn orphans_in_both_directions() {
        let ledger = vec![local("SOLUSDT", Side::Long, dec!(10), dec!(150))];
        let venue = vec![remote("ETHUSDT", Side::Short, dec!(2), dec!(4000))];

        let outcome = reconcile(&ledger, &venue, &Tolerances::default(), Utc::now());
        let names: Vec<_> = outcome.actions.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["CREATE_LOCAL", "CLOSE_LOCAL"]);

        let kinds: BTreeSet<_> = outcome.discrepancies.iter().map(|d| d.kind).collect();
        assert!(kinds.contains(&DiscrepancyKind::OrphanLocal));
        assert!(kinds.contains(&DiscrepancyKind::OrphanRemote));
    }

    #[test]
    fn second_pass_after_apply_is_clean() {
        let mut ledger = vec![
            local("BTCUSDT", Side::Long, dec!(0.5), dec!(100000)),
            local("SOLUSDT", Side::Long, dec!(10), dec!(150)),
        ];
        let venue = vec![
            remote("BTCUSDT", Side::Long, dec!(0.6), dec!(99000)),
            remote("ETHUSDT", Side::Short, dec!(2), dec!(4000)),
        ];
        let tolerances = Tolerances::default();

        let first = reconcile(&ledger, &venue, &tolerances, Utc::now());
        assert_eq!(first.actions.len(), 3);
        apply(&mut ledger, &first);

        let second = reconcile(&ledger, &venue, &tolerances, Utc::now());
        assert!(second.is_clean(), "{:?}", second.actions);
        assert!(second.discrepancies.is_empty());
        assert_eq!(second.synced.len(), 2);
    }

    #[test]
    fn closed_local_positions_are_ignored() {
        let mut closed = local("SOLUSDT", Side::Long, dec!(10), dec!(150));
        closed.status = PositionStatus::Closed;
        let outcome = reconcile(&[closed], &[], &Tolerances::default(), Utc::now());
        assert!(outcome.is_clean());
    }

    #[test]
    fn mark_drift_within_tolerance_is_not_a_mismatch() {
        let ledger = vec![local("BTCUSDT", Side::Long, dec!(0.5), dec!(100000))];
        let mut venue = remote("BTCUSDT", Side::Long, dec!(0.5), dec!(100000));

        venue.mark_price = dec!(100050);
        assert!(reconcile(&ledger, &[venue.clone()], &Tolerances::default(), Utc::now()).is_clean());

        venue.mark_price = dec!(101000);
        let outcome = reconcile(&ledger, &[venue], &Tolerances::default(), Utc::now());
        assert_eq!(outcome.discrepancies[0].kind, DiscrepancyKind::PriceMismatch);
    }

    #[test]
    fn sides_are_distinct_keys() {
        let ledger = vec![local("BTCUSDT", Side::Long, dec!(1), dec!(100000))];
        let venue = vec![
            remote("BTCUSDT", Side::Long, dec!(1), dec!(100000)),
            remote("BTCUSDT", Side::Short, dec!(1), dec!(100000)),
        ];
        let outcome = reconcile(&ledger, &venue, &Tolerances::default(), Utc::now());
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].key().side, Side::Short);
    }

    #[test]
    fn scoped_pass_leaves_other_keys_alone() {
        let ledger = vec![
            local("BTCUSDT", Side::Long, dec!(1), dec!(100000)),
            local("SOLUSDT", Side::Long, dec!(10), dec!(150)),
        ];
        let venue = vec![remote("BTCUSDT", Side::Long, dec!(2), dec!(100000))];
        let scope: BTreeSet<_> = [PositionKey::new(Venue::Binance, "BTCUSDT", Side::Long)]
            .into_iter()
            .collect();

        let outcome = reconcile_scoped(&ledger, &venue, &scope, &Tolerances::default(), Utc::now());
        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(outcome.actions[0].name(), "UPDATE_LOCAL");
    }
}
