//! Supervisor layer
//!
//! - Engine assembling venue loops over the shared ledger
//! - Alert manager for escalations that need an operator

pub mod alert_manager;
pub mod engine;

pub use alert_manager::{Alert, AlertLevel, AlertManager, AlertManagerConfig};
pub use engine::{ActiveOrderView, Engine, PositionProtection, ProtectionSummary, VenueSummary};
