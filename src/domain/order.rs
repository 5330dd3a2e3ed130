use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{Side, Venue};
use crate::error::{Result, WardenError};

/// Protective order kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    StopLoss,
    TrailingStop,
    TakeProfit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::StopLoss => "STOP_LOSS",
            OrderKind::TrailingStop => "TRAILING_STOP",
            OrderKind::TakeProfit => "TAKE_PROFIT",
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderKind {
    type Error = WardenError;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "STOP_LOSS" => Ok(OrderKind::StopLoss),
            "TRAILING_STOP" => Ok(OrderKind::TrailingStop),
            "TAKE_PROFIT" => Ok(OrderKind::TakeProfit),
            other => Err(WardenError::InvalidState(format!(
                "unknown order kind: {}",
                other
            ))),
        }
    }
}

/// Protective order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Placement attempted, not yet confirmed by the venue
    Pending,
    /// Resting on the venue
    Active,
    /// Triggered; observed through position closure
    Filled,
    /// Refused by the venue
    Rejected,
    /// Superseded or cancelled with its position
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Active => "ACTIVE",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    /// Live on the venue or about to be
    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Active)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = WardenError;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "ACTIVE" => Ok(OrderStatus::Active),
            "FILLED" => Ok(OrderStatus::Filled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(WardenError::InvalidState(format!(
                "unknown order status: {}",
                other
            ))),
        }
    }
}

/// How a protective order triggers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fixed trigger at a mark price
    Fixed { trigger_price: Decimal },
    /// Trailing stop armed at `activation_price`, trailing by `callback_rate` percent
    Trailing {
        activation_price: Decimal,
        callback_rate: Decimal,
    },
}

impl Trigger {
    /// Price used for the idempotency bucket
    pub fn reference_price(&self) -> Decimal {
        match self {
            Trigger::Fixed { trigger_price } => *trigger_price,
            Trigger::Trailing {
                activation_price, ..
            } => *activation_price,
        }
    }
}

/// Client order id accepted by every supported venue (Binance caps at 36 chars)
pub const CLIENT_ID_PREFIX: &str = "wd-";
const CLIENT_ID_HASH_LEN: usize = 32;

/// Derive the idempotency key for a protective order.
///
/// The key hashes symbol, side, kind and the trigger price rounded to five
/// significant digits, so retries of the same intent map to the same venue
/// client order id while a materially different trigger yields a new one.
pub fn idempotency_key(symbol: &str, side: Side, kind: OrderKind, price: Decimal) -> String {
    let bucket = price.round_sf(5).unwrap_or(price).normalize();
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(side.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}{}", CLIENT_ID_PREFIX, &digest[..CLIENT_ID_HASH_LEN])
}

/// Request handed to a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrderSpec {
    pub venue: Venue,
    pub symbol: String,
    /// Side of the position being protected
    pub position_side: Side,
    pub kind: OrderKind,
    pub trigger: Trigger,
    pub quantity: Decimal,
    pub idempotency_key: String,
}

impl ProtectiveOrderSpec {
    pub fn new(
        venue: Venue,
        symbol: impl Into<String>,
        position_side: Side,
        kind: OrderKind,
        trigger: Trigger,
        quantity: Decimal,
    ) -> Self {
        let symbol = symbol.into();
        let idempotency_key =
            idempotency_key(&symbol, position_side, kind, trigger.reference_price());
        Self {
            venue,
            symbol,
            position_side,
            kind,
            trigger,
            quantity,
            idempotency_key,
        }
    }
}

/// Venue acknowledgement of a placed protective order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub venue_order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    /// Trigger as rounded by the venue
    pub trigger: Trigger,
    pub quantity: Decimal,
}

/// Protective order resting on a venue, as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub venue_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub position_side: Side,
    pub kind: OrderKind,
    pub trigger: Trigger,
    pub quantity: Decimal,
}

/// Ledger record of a protective order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrder {
    pub id: Uuid,
    /// Back-reference to the owning position (lookup only)
    pub position_id: Uuid,
    pub kind: OrderKind,
    pub trigger: Trigger,
    pub quantity: Decimal,
    pub venue_order_id: Option<String>,
    pub idempotency_key: String,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProtectiveOrder {
    pub fn pending(position_id: Uuid, spec: &ProtectiveOrderSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            position_id,
            kind: spec.kind,
            trigger: spec.trigger,
            quantity: spec.quantity,
            venue_order_id: None,
            idempotency_key: spec.idempotency_key.clone(),
            status: OrderStatus::Pending,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record an order found resting on the venue that the ledger did not know about
    pub fn adopted(position_id: Uuid, venue_order: &VenueOrder, now: DateTime<Utc>) -> Self {
        let idempotency_key = venue_order.client_order_id.clone().unwrap_or_else(|| {
            idempotency_key(
                &venue_order.symbol,
                venue_order.position_side,
                venue_order.kind,
                venue_order.trigger.reference_price(),
            )
        });
        Self {
            id: Uuid::new_v4(),
            position_id,
            kind: venue_order.kind,
            trigger: venue_order.trigger,
            quantity: venue_order.quantity,
            venue_order_id: Some(venue_order.venue_order_id.clone()),
            idempotency_key,
            status: OrderStatus::Active,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == OrderStatus::Active
    }

    pub fn mark_active(&mut self, handle: &OrderHandle, now: DateTime<Utc>) {
        self.venue_order_id = Some(handle.venue_order_id.clone());
        self.trigger = handle.trigger;
        self.quantity = handle.quantity;
        self.status = handle.status;
        self.reject_reason = None;
        self.updated_at = now;
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = OrderStatus::Rejected;
        self.reject_reason = Some(reason.into());
        self.updated_at = now;
    }

    pub fn transition(&mut self, status: OrderStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn idempotency_key_fits_client_id_limits() {
        let key = idempotency_key("BTCUSDT", Side::Long, OrderKind::StopLoss, dec!(93500));
        assert!(key.starts_with(CLIENT_ID_PREFIX));
        assert_eq!(key.len(), 35);
        assert!(key.len() <= 36);
    }

    #[test]
    fn idempotency_key_buckets_prices() {
        // 5 significant digits: both round to 93500
        let a = idempotency_key("BTCUSDT", Side::Long, OrderKind::StopLoss, dec!(93500.2));
        let b = idempotency_key("BTCUSDT", Side::Long, OrderKind::StopLoss, dec!(93499.8));
        assert_eq!(a, b);

        let c = idempotency_key("BTCUSDT", Side::Long, OrderKind::StopLoss, dec!(93600));
        assert_ne!(a, c);
    }

    #[test]
    fn idempotency_key_distinguishes_kind_and_side() {
        let sl = idempotency_key("ETHUSDT", Side::Short, OrderKind::StopLoss, dec!(4260));
        let ts = idempotency_key("ETHUSDT", Side::Short, OrderKind::TrailingStop, dec!(4260));
        let long = idempotency_key("ETHUSDT", Side::Long, OrderKind::StopLoss, dec!(4260));
        assert_ne!(sl, ts);
        assert_ne!(sl, long);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Active.is_terminal());
        assert!(OrderStatus::Pending.is_live());
    }
}
