//! Venue connectors
//!
//! One [`VenueConnector`] implementation per venue, normalizing positions and
//! protective orders to the shapes in `crate::domain`, plus the guard layer
//! adding circuit breaking and retries.

pub mod binance;
pub mod bybit;
pub mod factory;
pub mod guarded;
pub mod paper;
pub mod stream;
pub mod symbols;
mod traits;

pub use factory::{build_venue_connector, guard_connector};
pub use guarded::GuardedConnector;
pub use paper::{PaperOp, PaperVenue};
pub use traits::{ConnectorResult, VenueConnector};

#[cfg(test)]
pub use traits::MockVenueConnector;
