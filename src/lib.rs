pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod monitor;
pub mod protection;
pub mod reconciliation;
pub mod services;
pub mod signing;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{
    CircuitBreaker, CircuitState, Clock, GracefulShutdown, ManualClock, ShutdownSignal,
    SystemClock,
};
pub use domain::{
    EntryFill, OrderKind, OrderStatus, Position, PositionKey, ProtectionPolicy, ProtectionStatus,
    ProtectiveOrder, Side, Venue,
};
pub use error::{ConnectorError, FailureKind, Result, WardenError};
pub use exchange::{GuardedConnector, PaperVenue, VenueConnector};
pub use ledger::{InMemoryLedger, Ledger};
pub use monitor::{CycleReport, LoopState, PassKind, VenueMonitor};
pub use supervisor::{AlertLevel, AlertManager, Engine};
