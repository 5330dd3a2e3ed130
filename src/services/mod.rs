pub mod metrics;
pub mod status;

pub use metrics::{Metrics, VenueCoverage};
pub use status::{router, serve, HealthResponse, HealthStatus};
