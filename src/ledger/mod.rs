//! Persistence ledger
//!
//! The ledger is the only state shared between venue loops. Each
//! reconciliation-and-protection pass lands as a single [`PassCommit`]:
//! either every action, order and status change of the pass is stored, or
//! none is.

pub mod locks;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::{LedgerBackend, LedgerConfig};
use crate::domain::{EntryFill, Position, ProtectionStatus, ProtectiveOrder, Venue};
use crate::error::{Result, WardenError};
use crate::reconciliation::{Discrepancy, ReconcileAction};

pub use locks::{KeyGuard, KeyLocks};
pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;

/// New protection level for a position, decided by the monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionUpdate {
    pub position_id: Uuid,
    pub status: ProtectionStatus,
}

/// Everything one pass writes
#[derive(Debug, Clone, Serialize)]
pub struct PassCommit {
    pub venue: Venue,
    pub pass_id: Uuid,
    pub committed_at: DateTime<Utc>,
    pub actions: Vec<ReconcileAction>,
    /// Matched positions whose sync time moves forward
    pub synced: Vec<Uuid>,
    pub protection: Vec<ProtectionUpdate>,
    /// Protective orders to insert or update, keyed by id
    pub orders: Vec<ProtectiveOrder>,
    pub discrepancies: Vec<Discrepancy>,
}

impl PassCommit {
    pub fn new(venue: Venue, committed_at: DateTime<Utc>) -> Self {
        Self {
            venue,
            pass_id: Uuid::new_v4(),
            committed_at,
            actions: Vec::new(),
            synced: Vec::new(),
            protection: Vec::new(),
            orders: Vec::new(),
            discrepancies: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.synced.is_empty()
            && self.protection.is_empty()
            && self.orders.is_empty()
            && self.discrepancies.is_empty()
    }

    /// Ids of positions created by this commit
    pub fn created_ids(&self) -> Vec<Uuid> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                ReconcileAction::CreateLocal { position } => Some(position.id),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionQuery {
    pub venue: Option<Venue>,
    pub include_closed: bool,
}

impl PositionQuery {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn venue(mut self, venue: Venue) -> Self {
        self.venue = Some(venue);
        self
    }

    pub fn all(mut self) -> Self {
        self.include_closed = true;
        self
    }
}

/// Audit-log entry of a detected discrepancy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedDiscrepancy {
    pub pass_id: Uuid,
    #[serde(flatten)]
    pub discrepancy: Discrepancy,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn open_positions(&self, venue: Venue) -> Result<Vec<Position>>;

    async fn positions(&self, query: PositionQuery) -> Result<Vec<Position>>;

    /// Protective orders of the given positions, any status
    async fn orders_for(&self, position_ids: &[Uuid]) -> Result<Vec<ProtectiveOrder>>;

    /// Register a committed entry fill. An entry on a key that already has
    /// an OPEN position scales into it at the weighted average price.
    async fn record_entry(&self, entry: &EntryFill, now: DateTime<Utc>) -> Result<Position>;

    /// Apply one pass atomically
    async fn commit_pass(&self, commit: &PassCommit) -> Result<()>;

    /// Most recent discrepancies first
    async fn recent_discrepancies(&self, limit: usize) -> Result<Vec<LoggedDiscrepancy>>;
}

/// Merge a fill into an open position
pub(crate) fn scale_into(position: &mut Position, entry: &EntryFill, now: DateTime<Utc>) {
    let total = position.quantity + entry.quantity;
    if total > Decimal::ZERO {
        position.entry_price =
            (position.entry_price * position.quantity + entry.entry_price * entry.quantity) / total;
    }
    position.quantity = total;
    if let Some(leverage) = entry.leverage {
        position.leverage = leverage;
    }
    position.last_synced_at = now;
}

/// Register an entry fill under the key's lock, so it cannot interleave
/// with a venue cycle touching the same position
pub async fn register_entry(
    ledger: &dyn Ledger,
    locks: &KeyLocks,
    entry: &EntryFill,
    now: DateTime<Utc>,
) -> Result<Position> {
    let key = crate::domain::PositionKey::new(entry.venue, entry.symbol.clone(), entry.side);
    let _guard = locks.lock(&key).await;
    let position = ledger.record_entry(entry, now).await?;
    info!(
        venue = %entry.venue,
        symbol = %entry.symbol,
        side = %entry.side,
        quantity = %position.quantity,
        "Entry fill registered"
    );
    Ok(position)
}

/// Open the configured ledger backend
pub async fn open_ledger(config: &LedgerConfig) -> Result<Arc<dyn Ledger>> {
    match config.backend {
        LedgerBackend::Memory => Ok(Arc::new(InMemoryLedger::new())),
        LedgerBackend::Postgres => {
            let url = config.url.as_deref().ok_or_else(|| {
                WardenError::InvalidConfig("ledger.url is required for postgres".to_string())
            })?;
            let ledger = PostgresLedger::new(url, config.max_connections).await?;
            ledger.migrate().await?;
            Ok(Arc::new(ledger))
        }
    }
}
