use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;

use crate::domain::{OrderHandle, PositionEvent, ProtectiveOrderSpec, RemotePosition, Venue, VenueOrder};
use crate::error::ConnectorError;

pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Normalized operations every venue exposes to the engine.
///
/// Venue-specific encodings (tick and step rounding, trailing-stop offset vs.
/// percentage, duplicate client-id answers) are resolved inside
/// implementations; callers only ever see the shapes in `crate::domain`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VenueConnector: Send + Sync {
    fn venue(&self) -> Venue;

    /// Open positions on the venue; zero-size entries are filtered out
    async fn list_positions(&self) -> ConnectorResult<Vec<RemotePosition>>;

    async fn get_mark_price(&self, symbol: &str) -> ConnectorResult<Decimal>;

    /// Place a reduce-only protective order. Re-sending the same
    /// idempotency key resolves to the existing venue order.
    async fn place_protective_order(
        &self,
        spec: &ProtectiveOrderSpec,
    ) -> ConnectorResult<OrderHandle>;

    /// Returns `false` when the venue no longer knows the order
    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> ConnectorResult<bool>;

    /// Protective orders currently resting on the venue
    async fn list_protective_orders(&self) -> ConnectorResult<Vec<VenueOrder>>;

    /// Infinite, self-reconnecting stream of position changes.
    /// Calling again starts a fresh subscription.
    fn stream_position_events(&self) -> BoxStream<'static, PositionEvent>;
}
