use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, WardenError};

/// Venue holding authoritative position state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    Binance,
    Bybit,
    /// In-memory simulated venue (dry runs and tests)
    Paper,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Paper => "paper",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Venue {
    type Err = WardenError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "binance" | "binance_futures" => Ok(Self::Binance),
            "bybit" => Ok(Self::Bybit),
            "paper" | "sim" => Ok(Self::Paper),
            other => Err(WardenError::Validation(format!(
                "invalid venue '{}'; expected binance|bybit|paper",
                other
            ))),
        }
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// Order side that reduces a position on this side
    pub fn closing_order_side(&self) -> &'static str {
        match self {
            Side::Long => "SELL",
            Side::Short => "BUY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Side {
    type Error = WardenError;

    fn try_from(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Side::Long),
            "SHORT" | "SELL" => Ok(Side::Short),
            other => Err(WardenError::Validation(format!("invalid side: {}", other))),
        }
    }
}

/// Ledger lifecycle of a position record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

impl TryFrom<&str> for PositionStatus {
    type Error = WardenError;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            other => Err(WardenError::InvalidState(format!(
                "unknown position status: {}",
                other
            ))),
        }
    }
}

/// Protection level reached by an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionStatus {
    Unprotected,
    StopLossPending,
    StopLossActive,
    TrailingPending,
    /// Stop-loss active, trailing stop rejected; retried next cycle
    PartiallyProtected,
    FullyProtected,
}

impl ProtectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionStatus::Unprotected => "UNPROTECTED",
            ProtectionStatus::StopLossPending => "STOP_LOSS_PENDING",
            ProtectionStatus::StopLossActive => "STOP_LOSS_ACTIVE",
            ProtectionStatus::TrailingPending => "TRAILING_PENDING",
            ProtectionStatus::PartiallyProtected => "PARTIALLY_PROTECTED",
            ProtectionStatus::FullyProtected => "FULLY_PROTECTED",
        }
    }

    /// A stop-loss is confirmed active on the venue.
    pub fn has_active_stop(&self) -> bool {
        !matches!(
            self,
            ProtectionStatus::Unprotected | ProtectionStatus::StopLossPending
        )
    }
}

impl std::fmt::Display for ProtectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ProtectionStatus {
    type Error = WardenError;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "UNPROTECTED" => Ok(ProtectionStatus::Unprotected),
            "STOP_LOSS_PENDING" => Ok(ProtectionStatus::StopLossPending),
            "STOP_LOSS_ACTIVE" => Ok(ProtectionStatus::StopLossActive),
            "TRAILING_PENDING" => Ok(ProtectionStatus::TrailingPending),
            "PARTIALLY_PROTECTED" => Ok(ProtectionStatus::PartiallyProtected),
            "FULLY_PROTECTED" => Ok(ProtectionStatus::FullyProtected),
            other => Err(WardenError::InvalidState(format!(
                "unknown protection status: {}",
                other
            ))),
        }
    }
}

/// Matching key between ledger and venue: (venue, symbol, side)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
}

impl PositionKey {
    pub fn new(venue: Venue, symbol: impl Into<String>, side: Side) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            side,
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.venue, self.symbol, self.side)
    }
}

/// Ledger position record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: u32,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub protection_status: ProtectionStatus,
    pub last_synced_at: DateTime<Utc>,
}

impl Position {
    /// Seed a new open position from a venue-only observation
    pub fn seed_from_remote(remote: &RemotePosition, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            venue: remote.venue,
            symbol: remote.symbol.clone(),
            side: remote.side,
            quantity: remote.quantity,
            entry_price: remote.entry_price,
            mark_price: remote.mark_price,
            leverage: remote.leverage,
            opened_at: remote.opened_at.unwrap_or(now),
            status: PositionStatus::Open,
            closed_at: None,
            protection_status: ProtectionStatus::Unprotected,
            last_synced_at: now,
        }
    }

    /// Build an open position from a committed entry fill
    pub fn from_entry(entry: &EntryFill, now: DateTime<Utc>) -> Result<Self> {
        if entry.quantity <= Decimal::ZERO {
            return Err(WardenError::Validation(format!(
                "entry fill for {} has non-positive quantity {}",
                entry.symbol, entry.quantity
            )));
        }
        if entry.entry_price <= Decimal::ZERO {
            return Err(WardenError::Validation(format!(
                "entry fill for {} has non-positive price {}",
                entry.symbol, entry.entry_price
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            venue: entry.venue,
            symbol: entry.symbol.clone(),
            side: entry.side,
            quantity: entry.quantity,
            entry_price: entry.entry_price,
            mark_price: entry.entry_price,
            leverage: entry.leverage.unwrap_or(1),
            opened_at: entry.opened_at,
            status: PositionStatus::Open,
            closed_at: None,
            protection_status: ProtectionStatus::Unprotected,
            last_synced_at: now,
        })
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.venue, self.symbol.clone(), self.side)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Notional value at mark price
    pub fn notional(&self) -> Decimal {
        self.quantity * self.mark_price
    }
}

/// Position as reported by a venue, normalized by its connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePosition {
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    /// Absolute size; connectors never report zero-size positions
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl RemotePosition {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.venue, self.symbol.clone(), self.side)
    }
}

/// Position change pushed by a venue stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    /// Zero means the position was closed
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Option<Decimal>,
    pub event_time: DateTime<Utc>,
}

impl PositionEvent {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.venue, self.symbol.clone(), self.side)
    }
}

/// Committed entry fill handed over by the order-placement subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFill {
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub leverage: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn venue_parses_aliases() {
        assert_eq!("binance".parse::<Venue>().unwrap(), Venue::Binance);
        assert_eq!("BYBIT".parse::<Venue>().unwrap(), Venue::Bybit);
        assert_eq!("sim".parse::<Venue>().unwrap(), Venue::Paper);
        assert!("kraken".parse::<Venue>().is_err());
    }

    #[test]
    fn stop_activity_by_status() {
        assert!(!ProtectionStatus::Unprotected.has_active_stop());
        assert!(!ProtectionStatus::StopLossPending.has_active_stop());
        assert!(ProtectionStatus::StopLossActive.has_active_stop());
        assert!(ProtectionStatus::PartiallyProtected.has_active_stop());
        assert!(ProtectionStatus::FullyProtected.has_active_stop());
    }

    #[test]
    fn seeded_position_starts_unprotected() {
        let remote = RemotePosition {
            venue: Venue::Bybit,
            symbol: "ETHUSDT".to_string(),
            side: Side::Short,
            quantity: dec!(2),
            entry_price: dec!(4000),
            mark_price: dec!(3990),
            leverage: 5,
            opened_at: None,
        };
        let now = Utc::now();
        let pos = Position::seed_from_remote(&remote, now);

        assert_eq!(pos.protection_status, ProtectionStatus::Unprotected);
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.opened_at, now);
        assert_eq!(pos.key(), remote.key());
    }

    #[test]
    fn entry_fill_rejects_zero_quantity() {
        let entry = EntryFill {
            venue: Venue::Binance,
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: Decimal::ZERO,
            entry_price: dec!(100000),
            opened_at: Utc::now(),
            leverage: Some(10),
        };
        assert!(Position::from_entry(&entry, Utc::now()).is_err());
    }
}
