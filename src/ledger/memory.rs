//! In-process ledger
//!
//! Backs dry runs and tests. A commit is validated in full before anything
//! is applied, which gives the same all-or-nothing behavior as a database
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{scale_into, Ledger, LoggedDiscrepancy, PassCommit, PositionQuery};
use crate::domain::{EntryFill, Position, PositionKey, ProtectiveOrder, Venue};
use crate::error::{Result, WardenError};
use crate::reconciliation::ReconcileAction;

const DISCREPANCY_LOG_CAPACITY: usize = 10_000;

#[derive(Default)]
struct LedgerState {
    positions: HashMap<Uuid, Position>,
    orders: HashMap<Uuid, ProtectiveOrder>,
    discrepancies: VecDeque<LoggedDiscrepancy>,
}

impl LedgerState {
    fn open_by_key(&self, key: &PositionKey) -> Option<&Position> {
        self.positions
            .values()
            .find(|p| p.is_open() && p.key() == *key)
    }

    fn validate(&self, commit: &PassCommit) -> std::result::Result<(), String> {
        let mut created: HashSet<Uuid> = HashSet::new();
        let mut closing: HashSet<Uuid> = HashSet::new();

        for action in &commit.actions {
            match action {
                ReconcileAction::CreateLocal { position } => {
                    if self.positions.contains_key(&position.id) {
                        return Err(format!("position {} already exists", position.id));
                    }
                    if let Some(existing) = self.open_by_key(&position.key()) {
                        if !commit.actions.iter().any(|a| {
                            matches!(a, ReconcileAction::CloseLocal { position_id, .. } if *position_id == existing.id)
                        }) {
                            return Err(format!("{} already has an open position", position.key()));
                        }
                    }
                    created.insert(position.id);
                }
                ReconcileAction::CloseLocal { position_id, .. }
                | ReconcileAction::UpdateLocal { position_id, .. } => {
                    match self.positions.get(position_id) {
                        Some(p) if p.is_open() => {}
                        Some(_) => return Err(format!("position {} is not open", position_id)),
                        None => return Err(format!("position {} not found", position_id)),
                    }
                    if matches!(action, ReconcileAction::CloseLocal { .. })
                        && !closing.insert(*position_id)
                    {
                        return Err(format!("position {} closed twice", position_id));
                    }
                }
            }
        }

        let known = |id: &Uuid| self.positions.contains_key(id) || created.contains(id);
        if let Some(id) = commit.synced.iter().find(|id| !self.positions.contains_key(id)) {
            return Err(format!("synced position {} not found", id));
        }
        if let Some(update) = commit.protection.iter().find(|u| !known(&u.position_id)) {
            return Err(format!("protection update for unknown position {}", update.position_id));
        }
        if let Some(order) = commit.orders.iter().find(|o| !known(&o.position_id)) {
            return Err(format!("order {} references unknown position {}", order.id, order.position_id));
        }
        Ok(())
    }

    fn apply(&mut self, commit: &PassCommit) {
        let now = commit.committed_at;
        for action in &commit.actions {
            match action {
                ReconcileAction::CreateLocal { position } => {
                    self.positions.insert(position.id, position.clone());
                }
                ReconcileAction::CloseLocal { position_id, .. }
                | ReconcileAction::UpdateLocal { position_id, .. } => {
                    if let Some(position) = self.positions.get_mut(position_id) {
                        action.apply_to(position, now);
                    }
                }
            }
        }
        for id in &commit.synced {
            if let Some(position) = self.positions.get_mut(id) {
                position.last_synced_at = now;
            }
        }
        for update in &commit.protection {
            if let Some(position) = self.positions.get_mut(&update.position_id) {
                position.protection_status = update.status;
            }
        }
        for order in &commit.orders {
            self.orders.insert(order.id, order.clone());
        }
        for discrepancy in &commit.discrepancies {
            if self.discrepancies.len() == DISCREPANCY_LOG_CAPACITY {
                self.discrepancies.pop_front();
            }
            self.discrepancies.push_back(LoggedDiscrepancy {
                pass_id: commit.pass_id,
                discrepancy: discrepancy.clone(),
            });
        }
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    failing_commits: AtomicU32,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail as a storage outage would
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Seed a position directly (fixtures)
    pub async fn insert_position(&self, position: Position) {
        self.state.write().await.positions.insert(position.id, position);
    }

    pub async fn get_position(&self, id: Uuid) -> Option<Position> {
        self.state.read().await.positions.get(&id).cloned()
    }

    pub async fn position_count(&self) -> usize {
        self.state.read().await.positions.len()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn open_positions(&self, venue: Venue) -> Result<Vec<Position>> {
        self.positions(PositionQuery::open().venue(venue)).await
    }

    async fn positions(&self, query: PositionQuery) -> Result<Vec<Position>> {
        let state = self.state.read().await;
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| query.include_closed || p.is_open())
            .filter(|p| query.venue.map_or(true, |v| p.venue == v))
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.key().cmp(&b.key()).then(a.opened_at.cmp(&b.opened_at)));
        Ok(positions)
    }

    async fn orders_for(&self, position_ids: &[Uuid]) -> Result<Vec<ProtectiveOrder>> {
        let ids: HashSet<&Uuid> = position_ids.iter().collect();
        let state = self.state.read().await;
        let mut orders: Vec<ProtectiveOrder> = state
            .orders
            .values()
            .filter(|o| ids.contains(&o.position_id))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn record_entry(&self, entry: &EntryFill, now: DateTime<Utc>) -> Result<Position> {
        let fresh = Position::from_entry(entry, now)?;
        let mut state = self.state.write().await;

        let existing_id = state.open_by_key(&fresh.key()).map(|p| p.id);
        if let Some(id) = existing_id {
            if let Some(position) = state.positions.get_mut(&id) {
                scale_into(position, entry, now);
                return Ok(position.clone());
            }
        }

        state.positions.insert(fresh.id, fresh.clone());
        Ok(fresh)
    }

    async fn commit_pass(&self, commit: &PassCommit) -> Result<()> {
        let remaining = self.failing_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_commits.store(remaining - 1, Ordering::SeqCst);
            warn!(venue = %commit.venue, pass_id = %commit.pass_id, "Injected ledger failure");
            return Err(WardenError::LedgerWrite("injected ledger failure".to_string()));
        }

        let mut state = self.state.write().await;
        state.validate(commit).map_err(WardenError::LedgerWrite)?;
        state.apply(commit);
        debug!(
            venue = %commit.venue,
            pass_id = %commit.pass_id,
            actions = commit.actions.len(),
            orders = commit.orders.len(),
            "Pass committed"
        );
        Ok(())
    }

    async fn recent_discrepancies(&self, limit: usize) -> Result<Vec<LoggedDiscrepancy>> {
        let state = self.state.read().await;
        Ok(state.discrepancies.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderKind, ProtectionStatus, ProtectiveOrderSpec, RemotePosition, Side, Trigger};
    use crate::ledger::ProtectionUpdate;
    use rust_decimal_macros::dec;

    fn remote(symbol: &str) -> RemotePosition {
        RemotePosition {
            venue: Venue::Bybit,
            symbol: symbol.to_string(),
            side: Side::Short,
            quantity: dec!(2),
            entry_price: dec!(4000),
            mark_price: dec!(4000),
            leverage: 5,
            opened_at: None,
        }
    }

    #[tokio::test]
    async fn commit_applies_actions_orders_and_status() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let position = Position::seed_from_remote(&remote("ETHUSDT"), now);
        let spec = ProtectiveOrderSpec::new(
            Venue::Bybit,
            "ETHUSDT",
            Side::Short,
            OrderKind::StopLoss,
            Trigger::Fixed { trigger_price: dec!(4260) },
            dec!(2),
        );

        let mut commit = PassCommit::new(Venue::Bybit, now);
        commit.orders.push(ProtectiveOrder::pending(position.id, &spec, now));
        commit.protection.push(ProtectionUpdate {
            position_id: position.id,
            status: ProtectionStatus::StopLossPending,
        });
        commit.actions.push(ReconcileAction::CreateLocal { position: position.clone() });

        ledger.commit_pass(&commit).await.unwrap();

        let stored = ledger.get_position(position.id).await.unwrap();
        assert_eq!(stored.protection_status, ProtectionStatus::StopLossPending);
        assert_eq!(ledger.orders_for(&[position.id]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_commit_applies_nothing() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let position = Position::seed_from_remote(&remote("ETHUSDT"), now);

        let mut commit = PassCommit::new(Venue::Bybit, now);
        commit.actions.push(ReconcileAction::CreateLocal { position: position.clone() });
        commit.actions.push(ReconcileAction::CloseLocal {
            position_id: Uuid::new_v4(),
            key: position.key(),
            closed_at: now,
        });

        assert!(matches!(
            ledger.commit_pass(&commit).await,
            Err(WardenError::LedgerWrite(_))
        ));
        assert_eq!(ledger.position_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_open_key_is_rejected() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        ledger
            .insert_position(Position::seed_from_remote(&remote("ETHUSDT"), now))
            .await;

        let mut commit = PassCommit::new(Venue::Bybit, now);
        commit.actions.push(ReconcileAction::CreateLocal {
            position: Position::seed_from_remote(&remote("ETHUSDT"), now),
        });
        assert!(ledger.commit_pass(&commit).await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next_commits(1);
        let commit = PassCommit::new(Venue::Paper, Utc::now());
        assert!(ledger.commit_pass(&commit).await.is_err());
        assert!(ledger.commit_pass(&commit).await.is_ok());
    }

    #[tokio::test]
    async fn entry_scales_into_open_position() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let entry = EntryFill {
            venue: Venue::Binance,
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: dec!(1),
            entry_price: dec!(100000),
            opened_at: now,
            leverage: Some(10),
        };
        let first = ledger.record_entry(&entry, now).await.unwrap();

        let add = EntryFill {
            entry_price: dec!(102000),
            ..entry.clone()
        };
        let merged = ledger.record_entry(&add, now).await.unwrap();

        assert_eq!(merged.id, first.id);
        assert_eq!(merged.quantity, dec!(2));
        assert_eq!(merged.entry_price, dec!(101000));
        assert_eq!(merged.protection_status, ProtectionStatus::Unprotected);
    }

    #[tokio::test]
    async fn discrepancies_are_logged_newest_first() {
        use crate::reconciliation::{Discrepancy, DiscrepancyKind};

        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        for kind in [DiscrepancyKind::OrphanRemote, DiscrepancyKind::QuantityMismatch] {
            let mut commit = PassCommit::new(Venue::Bybit, now);
            commit.discrepancies.push(Discrepancy {
                kind,
                key: PositionKey::new(Venue::Bybit, "ETHUSDT", Side::Short),
                local_value: None,
                remote_value: Some(dec!(2)),
                detected_at: now,
            });
            ledger.commit_pass(&commit).await.unwrap();
        }

        let logged = ledger.recent_discrepancies(1).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].discrepancy.kind, DiscrepancyKind::QuantityMismatch);
    }
}
