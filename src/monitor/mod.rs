//! Protection monitor
//!
//! One loop per venue. Each pass reconciles the ledger against the venue,
//! places whatever protection open positions are missing, and commits the
//! result in one ledger write.

pub mod escalation;
pub mod queue;
pub mod scheduler;
pub mod venue_loop;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::coordination::Clock;
use crate::domain::Venue;
use crate::ledger::{KeyLocks, Ledger};
use crate::protection::ProtectionFailure;
use crate::services::Metrics;
use crate::supervisor::AlertManager;

pub use escalation::Escalator;
pub use queue::EventQueue;
pub use scheduler::{ForceRequest, Scheduler, Wake};
pub use venue_loop::{VenueHandle, VenueMonitor};

/// What triggered a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassKind {
    /// Poll interval elapsed
    Full,
    /// Stream events for specific keys
    Scoped,
    /// Operator request; same scope as a full pass
    Forced,
}

impl PassKind {
    pub fn is_full(&self) -> bool {
        !matches!(self, PassKind::Scoped)
    }
}

/// Lifecycle of a venue loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum LoopState {
    Running,
    Halted(String),
    Stopped,
}

/// Summary of one pass
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub venue: Venue,
    pub pass_id: Uuid,
    pub kind: PassKind,
    pub started_at: DateTime<Utc>,
    pub actions: usize,
    pub discrepancies: usize,
    pub orders_placed: usize,
    pub open: usize,
    pub fully_protected: usize,
    pub partially_protected: usize,
    /// Open positions without an active stop-loss
    pub unprotected: usize,
    pub failures: Vec<ProtectionFailure>,
    pub committed: bool,
    pub error: Option<String>,
}

impl CycleReport {
    pub fn new(venue: Venue, pass_id: Uuid, kind: PassKind, started_at: DateTime<Utc>) -> Self {
        Self {
            venue,
            pass_id,
            kind,
            started_at,
            actions: 0,
            discrepancies: 0,
            orders_placed: 0,
            open: 0,
            fully_protected: 0,
            partially_protected: 0,
            unprotected: 0,
            failures: Vec::new(),
            committed: false,
            error: None,
        }
    }

    pub fn aborted(mut self, error: impl Into<String>) -> Self {
        self.committed = false;
        self.error = Some(error.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Dependencies shared by every venue loop
#[derive(Clone)]
pub struct MonitorContext {
    pub ledger: Arc<dyn Ledger>,
    pub locks: Arc<KeyLocks>,
    pub clock: Arc<dyn Clock>,
    pub alerts: Arc<AlertManager>,
    pub metrics: Arc<Metrics>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PositionKey, Side};
    use crate::error::FailureKind;

    #[test]
    fn report_serializes_failure_kinds() {
        let mut report = CycleReport::new(Venue::Binance, Uuid::new_v4(), PassKind::Forced, Utc::now());
        report.failures.push(ProtectionFailure {
            key: PositionKey::new(Venue::Binance, "BTCUSDT", Side::Long),
            action: "place TRAILING_STOP".to_string(),
            kind: FailureKind::VenueRejected,
            message: "would immediately trigger".to_string(),
        });

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["failures"][0]["kind"], "VENUE_REJECTED");
    }
}
