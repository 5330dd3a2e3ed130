//! Bounded stream-event queue
//!
//! Fed by a venue's stream task, drained by its loop. On overflow the oldest
//! event is dropped; the periodic full pass re-derives anything lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::domain::PositionEvent;

pub struct EventQueue {
    events: Mutex<VecDeque<PositionEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<PositionEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue, evicting the oldest event when full. Returns whether one was evicted.
    pub fn push(&self, event: PositionEvent) -> bool {
        let evicted = {
            let mut events = self.events();
            let evicted = if events.len() >= self.capacity {
                events.pop_front();
                true
            } else {
                false
            };
            events.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn drain(&self) -> Vec<PositionEvent> {
        self.events().drain(..).collect()
    }

    /// Resolves once at least one event is queued
    pub async fn wait(&self) {
        loop {
            if !self.is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, Venue};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(symbol: &str) -> PositionEvent {
        PositionEvent {
            venue: Venue::Binance,
            symbol: symbol.to_string(),
            side: Side::Long,
            quantity: Decimal::ONE,
            entry_price: Decimal::ONE_HUNDRED,
            mark_price: None,
            event_time: Utc::now(),
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = EventQueue::new(2);
        assert!(!queue.push(event("A")));
        assert!(!queue.push(event("B")));
        assert!(queue.push(event("C")));

        let symbols: Vec<_> = queue.drain().into_iter().map(|e| e.symbol).collect();
        assert_eq!(symbols, vec!["B", "C"]);
        assert_eq!(queue.dropped(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn wait_wakes_on_push() {
        let queue = Arc::new(EventQueue::new(8));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait().await })
        };
        tokio::task::yield_now().await;
        queue.push(event("BTCUSDT"));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
