//! Coordination Layer for continuous venue monitoring
//!
//! - Injectable clock driving cadence, backoff and cooldowns
//! - Per-venue circuit breaker
//! - Retry policy for connector calls
//! - Graceful shutdown handling

pub mod circuit_breaker;
pub mod clock;
pub mod retry;
pub mod shutdown;

pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use retry::RetryPolicy;
pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownError, ShutdownSignal};
