//! On-demand audit
//!
//! Diffs the ledger against one venue outside the monitor loop. Read-only
//! unless asked to apply, in which case the ledger actions land in a single
//! commit. Protection is left to the monitor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::engine::{reconcile, ReconcileOutcome, Tolerances};
use crate::domain::{Position, PositionKey, RemotePosition, Venue};
use crate::error::Result;
use crate::exchange::VenueConnector;
use crate::ledger::{KeyLocks, Ledger, PassCommit};

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub venue: Venue,
    pub audited_at: DateTime<Utc>,
    pub local_open: usize,
    pub remote_open: usize,
    pub outcome: ReconcileOutcome,
    pub applied: bool,
}

pub async fn audit_venue(
    connector: &dyn VenueConnector,
    ledger: &dyn Ledger,
    locks: &KeyLocks,
    tolerances: &Tolerances,
    apply: bool,
    now: DateTime<Utc>,
) -> Result<AuditReport> {
    let venue = connector.venue();
    let remote = connector.list_positions().await?;
    let local = ledger.open_positions(venue).await?;

    let keys: Vec<PositionKey> = local
        .iter()
        .map(Position::key)
        .chain(remote.iter().map(RemotePosition::key))
        .collect();
    let guard = locks.lock_all(keys).await;
    let local: Vec<Position> = ledger
        .open_positions(venue)
        .await?
        .into_iter()
        .filter(|p| guard.covers(&p.key()))
        .collect();

    let outcome = reconcile(&local, &remote, tolerances, now);
    info!(
        venue = %venue,
        actions = outcome.actions.len(),
        discrepancies = outcome.discrepancies.len(),
        apply,
        "Audit complete"
    );

    let applied = apply && !outcome.is_clean();
    if applied {
        let mut commit = PassCommit::new(venue, now);
        commit.actions = outcome.actions.clone();
        commit.synced = outcome.synced.clone();
        commit.discrepancies = outcome.discrepancies.clone();
        ledger.commit_pass(&commit).await?;
    }

    Ok(AuditReport {
        venue,
        audited_at: now,
        local_open: local.len(),
        remote_open: remote.len(),
        outcome,
        applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::exchange::PaperVenue;
    use crate::ledger::InMemoryLedger;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn dry_run_leaves_ledger_untouched() {
        let venue = PaperVenue::new();
        venue.set_position("BTCUSDT", Side::Long, dec!(0.5), dec!(100000));
        let ledger = InMemoryLedger::new();

        let report = audit_venue(&venue, &ledger, &KeyLocks::new(), &Tolerances::default(), false, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.outcome.actions.len(), 1);
        assert!(!report.applied);
        assert!(ledger.open_positions(Venue::Paper).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_commits_actions() {
        let venue = PaperVenue::new();
        venue.set_position("BTCUSDT", Side::Long, dec!(0.5), dec!(100000));
        let ledger = InMemoryLedger::new();
        let locks = KeyLocks::new();

        let report = audit_venue(&venue, &ledger, &locks, &Tolerances::default(), true, Utc::now())
            .await
            .unwrap();
        assert!(report.applied);
        assert_eq!(ledger.open_positions(Venue::Paper).await.unwrap().len(), 1);

        let again = audit_venue(&venue, &ledger, &locks, &Tolerances::default(), true, Utc::now())
            .await
            .unwrap();
        assert!(again.outcome.is_clean());
        assert!(!again.applied);
    }
}
