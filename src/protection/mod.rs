//! Mandatory protection for open positions

pub mod executor;
pub mod state_machine;

pub use executor::{ProtectionExecutor, ProtectionFailure, ProtectionOutcome};
pub use state_machine::{assess, plan, ProtectionAction, ProtectionPlan};
