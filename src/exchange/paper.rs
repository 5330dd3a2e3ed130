//! In-memory simulated venue
//!
//! Holds positions and resting protective orders in process memory. Used for
//! dry runs and as the deterministic venue in tests: failures can be scripted
//! per call and order kinds can be forced to reject.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

use super::traits::{ConnectorResult, VenueConnector};
use crate::domain::{
    OrderHandle, OrderKind, OrderStatus, PositionEvent, ProtectiveOrderSpec, RemotePosition, Side,
    Venue, VenueOrder,
};
use crate::error::ConnectorError;

const EVENT_CAPACITY: usize = 256;

/// Connector operations, for call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    ListPositions,
    MarkPrice,
    Place,
    Cancel,
    ListOrders,
}

#[derive(Default)]
struct PaperState {
    positions: BTreeMap<(String, Side), RemotePosition>,
    orders: BTreeMap<String, VenueOrder>,
    marks: HashMap<String, Decimal>,
    scripted_failures: VecDeque<ConnectorError>,
    rejected_kinds: HashMap<OrderKind, String>,
    calls: HashMap<PaperOp, u64>,
}

pub struct PaperVenue {
    venue: Venue,
    state: Mutex<PaperState>,
    next_order_id: AtomicU64,
    events: broadcast::Sender<PositionEvent>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::for_venue(Venue::Paper)
    }

    /// Simulate a specific venue (tests exercising venue-scoped behavior)
    pub fn for_venue(venue: Venue) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            venue,
            state: Mutex::new(PaperState::default()),
            next_order_id: AtomicU64::new(1),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open or resize a position and publish the change
    pub fn set_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        entry_price: Decimal,
    ) -> RemotePosition {
        let mut state = self.state();
        let mark_price = state.marks.get(symbol).copied().unwrap_or(entry_price);
        let position = RemotePosition {
            venue: self.venue,
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price,
            mark_price,
            leverage: 1,
            opened_at: Some(Utc::now()),
        };
        state
            .positions
            .insert((symbol.to_string(), side), position.clone());
        drop(state);

        self.publish(symbol, side, quantity, entry_price, Some(mark_price));
        position
    }

    /// Close a position externally. Resting orders stay until cancelled.
    pub fn close_position(&self, symbol: &str, side: Side) {
        let removed = self.state().positions.remove(&(symbol.to_string(), side));
        if removed.is_some() {
            self.publish(symbol, side, Decimal::ZERO, Decimal::ZERO, None);
        }
    }

    pub fn set_mark_price(&self, symbol: &str, mark: Decimal) {
        let mut state = self.state();
        state.marks.insert(symbol.to_string(), mark);
        for ((sym, _), position) in state.positions.iter_mut() {
            if sym == symbol {
                position.mark_price = mark;
            }
        }
    }

    /// Fail the next calls, in order, with the given errors
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ConnectorError>) {
        self.state().scripted_failures.extend(errors);
    }

    pub fn reject_kind(&self, kind: OrderKind, reason: &str) {
        self.state().rejected_kinds.insert(kind, reason.to_string());
    }

    pub fn accept_kind(&self, kind: OrderKind) {
        self.state().rejected_kinds.remove(&kind);
    }

    /// Drop a resting order as if cancelled by an operator on the venue
    pub fn remove_order(&self, venue_order_id: &str) -> Option<VenueOrder> {
        self.state().orders.remove(venue_order_id)
    }

    pub fn open_orders(&self) -> Vec<VenueOrder> {
        self.state().orders.values().cloned().collect()
    }

    pub fn open_orders_for(&self, symbol: &str, kind: OrderKind) -> Vec<VenueOrder> {
        self.state()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.kind == kind)
            .cloned()
            .collect()
    }

    pub fn calls(&self, op: PaperOp) -> u64 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Calls that reached the simulated network
    pub fn total_calls(&self) -> u64 {
        self.state().calls.values().sum()
    }

    fn publish(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        entry_price: Decimal,
        mark_price: Option<Decimal>,
    ) {
        let _ = self.events.send(PositionEvent {
            venue: self.venue,
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price,
            mark_price,
            event_time: Utc::now(),
        });
    }

    fn enter(&self, op: PaperOp) -> ConnectorResult<MutexGuard<'_, PaperState>> {
        let mut state = self.state();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.scripted_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueConnector for PaperVenue {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn list_positions(&self) -> ConnectorResult<Vec<RemotePosition>> {
        let state = self.enter(PaperOp::ListPositions)?;
        Ok(state
            .positions
            .values()
            .filter(|p| !p.quantity.is_zero())
            .cloned()
            .collect())
    }

    async fn get_mark_price(&self, symbol: &str) -> ConnectorResult<Decimal> {
        let state = self.enter(PaperOp::MarkPrice)?;
        state
            .marks
            .get(symbol)
            .copied()
            .or_else(|| {
                state
                    .positions
                    .values()
                    .find(|p| p.symbol == symbol)
                    .map(|p| p.mark_price)
            })
            .ok_or_else(|| ConnectorError::rejected("-1121", format!("Invalid symbol {}", symbol)))
    }

    async fn place_protective_order(
        &self,
        spec: &ProtectiveOrderSpec,
    ) -> ConnectorResult<OrderHandle> {
        let mut state = self.enter(PaperOp::Place)?;

        if let Some(reason) = state.rejected_kinds.get(&spec.kind) {
            return Err(ConnectorError::rejected("paper", reason.clone()));
        }

        // Same client id resolves to the resting order
        if let Some(existing) = state
            .orders
            .values()
            .find(|o| o.client_order_id.as_deref() == Some(spec.idempotency_key.as_str()))
        {
            debug!(client_order_id = %spec.idempotency_key, "Paper venue duplicate client id");
            return Ok(OrderHandle {
                venue_order_id: existing.venue_order_id.clone(),
                client_order_id: spec.idempotency_key.clone(),
                status: OrderStatus::Active,
                trigger: existing.trigger,
                quantity: existing.quantity,
            });
        }

        if spec.quantity <= Decimal::ZERO {
            return Err(ConnectorError::rejected("paper", "quantity must be positive"));
        }

        let venue_order_id = format!(
            "paper-{}",
            self.next_order_id.fetch_add(1, Ordering::SeqCst)
        );
        let order = VenueOrder {
            venue_order_id: venue_order_id.clone(),
            client_order_id: Some(spec.idempotency_key.clone()),
            symbol: spec.symbol.clone(),
            position_side: spec.position_side,
            kind: spec.kind,
            trigger: spec.trigger,
            quantity: spec.quantity,
        };
        state.orders.insert(venue_order_id.clone(), order);

        Ok(OrderHandle {
            venue_order_id,
            client_order_id: spec.idempotency_key.clone(),
            status: OrderStatus::Active,
            trigger: spec.trigger,
            quantity: spec.quantity,
        })
    }

    async fn cancel_order(&self, _symbol: &str, venue_order_id: &str) -> ConnectorResult<bool> {
        let mut state = self.enter(PaperOp::Cancel)?;
        Ok(state.orders.remove(venue_order_id).is_some())
    }

    async fn list_protective_orders(&self) -> ConnectorResult<Vec<VenueOrder>> {
        let state = self.enter(PaperOp::ListOrders)?;
        Ok(state.orders.values().cloned().collect())
    }

    fn stream_position_events(&self) -> BoxStream<'static, PositionEvent> {
        let rx = self.events.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
