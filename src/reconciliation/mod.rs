//! Reconciliation between the ledger and venue-reported state
//!
//! The same engine backs the continuous venue loops and the on-demand audit.

pub mod audit;
pub mod engine;
pub mod tracker;

pub use audit::{audit_venue, AuditReport};
pub use engine::{
    reconcile, reconcile_scoped, Discrepancy, DiscrepancyKind, ReconcileAction, ReconcileOutcome,
    Tolerances,
};
pub use tracker::{DiscrepancyTracker, Escalation, TrackerUpdate};
