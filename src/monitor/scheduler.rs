//! Venue loop scheduling
//!
//! Decides what a venue loop does next: a full pass when the poll interval
//! elapses, a scoped pass when stream events arrive, a forced pass on
//! operator request, or stop on shutdown. Full passes run on the timer no
//! matter how busy the stream is.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use super::queue::EventQueue;
use super::CycleReport;
use crate::coordination::clock::elapsed_between;
use crate::coordination::Clock;
use crate::domain::PositionEvent;

/// Operator request for an immediate full pass
pub type ForceRequest = oneshot::Sender<CycleReport>;

pub enum Wake {
    Poll,
    Events(Vec<PositionEvent>),
    Forced(ForceRequest),
    Shutdown,
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    interval: Duration,
    next_due: DateTime<Utc>,
    queue: Arc<EventQueue>,
    force_rx: Option<mpsc::Receiver<ForceRequest>>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    /// The first full pass is due immediately
    pub fn new(
        clock: Arc<dyn Clock>,
        interval: Duration,
        queue: Arc<EventQueue>,
        force_rx: mpsc::Receiver<ForceRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let next_due = clock.now();
        Self {
            clock,
            interval,
            next_due,
            queue,
            force_rx: Some(force_rx),
            shutdown,
        }
    }

    /// Push the next timed pass one interval past `now`
    pub fn full_pass_done(&mut self) {
        self.next_due = self.clock.now() + crate::coordination::clock::to_chrono(self.interval);
    }

    pub fn next_due(&self) -> DateTime<Utc> {
        self.next_due
    }

    pub async fn next(&mut self) -> Wake {
        loop {
            if *self.shutdown.borrow() {
                return Wake::Shutdown;
            }

            let now = self.clock.now();
            if now >= self.next_due {
                return Wake::Poll;
            }
            let wait = elapsed_between(now, self.next_due);

            let force_rx = &mut self.force_rx;
            let forced = async {
                match force_rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Wake::Shutdown;
                    }
                }
                request = forced => match request {
                    Some(reply) => return Wake::Forced(reply),
                    None => self.force_rx = None,
                },
                _ = self.clock.sleep(wait) => return Wake::Poll,
                _ = self.queue.wait() => {
                    let events = self.queue.drain();
                    if !events.is_empty() {
                        return Wake::Events(events);
                    }
                }
            }
        }
    }
}
