//! Per-venue reconciliation and protection loop

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::escalation::Escalator;
use super::queue::EventQueue;
use super::scheduler::{ForceRequest, Scheduler, Wake};
use super::{CycleReport, LoopState, MonitorContext, PassKind};
use crate::config::AppConfig;
use crate::domain::{
    ActivationReference, OrderKind, OrderStatus, Position, PositionKey, ProtectionStatus,
    ProtectiveOrder, RemotePosition, Venue, VenueOrder,
};
use crate::error::{ConnectorError, Result, WardenError};
use crate::exchange::VenueConnector;
use crate::ledger::{PassCommit, ProtectionUpdate};
use crate::protection::{plan, ProtectionExecutor, ProtectionOutcome};
use crate::reconciliation::{reconcile, reconcile_scoped, ReconcileAction, Tolerances};
use crate::services::{Metrics, VenueCoverage};

const FORCE_QUEUE: usize = 8;

pub struct VenueMonitor {
    venue: Venue,
    connector: Arc<dyn VenueConnector>,
    executor: ProtectionExecutor,
    ctx: MonitorContext,
    tolerances: Tolerances,
    escalator: Escalator,
    poll_interval: Duration,
    stream_enabled: bool,
    queue_capacity: usize,
    max_concurrent: usize,
    max_auth_failures: u32,
    auth_failures: u32,
    state: watch::Sender<LoopState>,
    stream_task: Option<JoinHandle<()>>,
}

impl VenueMonitor {
    pub fn new(connector: Arc<dyn VenueConnector>, ctx: MonitorContext, config: &AppConfig) -> Self {
        let policy = config.protection.policy();
        let escalator = Escalator::new(
            ctx.alerts.clone(),
            config.protection.grace_cycles,
            config.monitor.discrepancy_escalation_passes,
            policy.mandatory,
        );
        let (state, _) = watch::channel(LoopState::Running);
        Self {
            venue: connector.venue(),
            executor: ProtectionExecutor::new(connector.clone(), policy),
            connector,
            ctx,
            tolerances: Tolerances::from(&config.reconciliation),
            escalator,
            poll_interval: config.monitor.poll_interval(),
            stream_enabled: config.monitor.stream_enabled,
            queue_capacity: config.monitor.event_queue_capacity,
            max_concurrent: config.monitor.max_concurrent_positions.max(1),
            max_auth_failures: config.monitor.max_auth_failures.max(1),
            auth_failures: 0,
            state,
            stream_task: None,
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    /// Consecutive passes that hit an authentication failure
    pub fn auth_failures(&self) -> u32 {
        self.auth_failures
    }

    /// Run one pass. `scope` restricts it to the given keys.
    pub async fn run_pass(
        &mut self,
        kind: PassKind,
        scope: Option<BTreeSet<PositionKey>>,
    ) -> CycleReport {
        let now = self.ctx.clock.now();
        let mut commit = PassCommit::new(self.venue, now);
        let mut report = CycleReport::new(self.venue, commit.pass_id, kind, now);

        // Read the ledger before the venue: a position recorded after the
        // snapshot must not be mistaken for one closed externally
        let before = match self.ctx.ledger.open_positions(self.venue).await {
            Ok(local) => local,
            Err(err) => return self.ledger_failed(report, err),
        };

        let remote = match self.connector.list_positions().await {
            Ok(remote) => remote,
            Err(err) => return self.fetch_failed(report, "list_positions", err),
        };
        let venue_orders = match self.connector.list_protective_orders().await {
            Ok(orders) => orders,
            Err(err) => return self.fetch_failed(report, "list_protective_orders", err),
        };

        let in_scope = |key: &PositionKey| scope.as_ref().map_or(true, |s| s.contains(key));
        let keys: BTreeSet<PositionKey> = before
            .iter()
            .map(Position::key)
            .chain(remote.iter().map(RemotePosition::key))
            .filter(|key| in_scope(key))
            .collect();

        let guard = self.ctx.locks.lock_all(keys).await;

        // Re-read under the locks for the latest quantities. Positions opened
        // after the snapshot that the venue did not report wait for the next pass.
        let seen: BTreeSet<Uuid> = before.iter().map(|p| p.id).collect();
        let remote_keys: BTreeSet<PositionKey> = remote.iter().map(RemotePosition::key).collect();
        let local: Vec<Position> = match self.ctx.ledger.open_positions(self.venue).await {
            Ok(local) => local
                .into_iter()
                .filter(|p| guard.covers(&p.key()))
                .filter(|p| seen.contains(&p.id) || remote_keys.contains(&p.key()))
                .collect(),
            Err(err) => return self.ledger_failed(report, err),
        };
        let remote: Vec<RemotePosition> = remote
            .into_iter()
            .filter(|r| guard.covers(&r.key()))
            .collect();

        let outcome = match &scope {
            Some(scope) => reconcile_scoped(&local, &remote, scope, &self.tolerances, now),
            None => reconcile(&local, &remote, &self.tolerances, now),
        };
        for discrepancy in &outcome.discrepancies {
            info!(
                venue = %self.venue,
                symbol = %discrepancy.key.symbol,
                side = %discrepancy.key.side,
                kind = %discrepancy.kind,
                local = ?discrepancy.local_value,
                remote = ?discrepancy.remote_value,
                "Discrepancy detected"
            );
        }

        let ledger_orders = match self
            .ctx
            .ledger
            .orders_for(&local.iter().map(|p| p.id).collect::<Vec<_>>())
            .await
        {
            Ok(orders) => orders,
            Err(err) => return self.ledger_failed(report, err),
        };
        let mut orders_by_position: HashMap<Uuid, Vec<ProtectiveOrder>> = HashMap::new();
        for order in ledger_orders {
            orders_by_position.entry(order.position_id).or_default().push(order);
        }

        // Apply actions to the working set
        let mut positions: BTreeMap<PositionKey, Position> =
            local.iter().map(|p| (p.key(), p.clone())).collect();
        let mut closed = Vec::new();
        for action in &outcome.actions {
            let key = action.key();
            match action {
                ReconcileAction::CreateLocal { position } => {
                    positions.insert(key.clone(), position.clone());
                }
                ReconcileAction::CloseLocal { .. } => {
                    if let Some(mut position) = positions.remove(&key) {
                        action.apply_to(&mut position, now);
                        closed.push(position);
                    }
                }
                ReconcileAction::UpdateLocal { .. } => {
                    if let Some(position) = positions.get_mut(&key) {
                        action.apply_to(position, now);
                    }
                }
            }
            info!(
                venue = %self.venue,
                symbol = %key.symbol,
                side = %key.side,
                action = action.name(),
                "Reconcile action"
            );
        }

        let mut touched: BTreeMap<Uuid, ProtectiveOrder> = BTreeMap::new();
        for position in &closed {
            let orders = orders_by_position.remove(&position.id).unwrap_or_default();
            for order in self.settle_closed(position, orders, &venue_orders, now).await {
                touched.insert(order.id, order);
            }
        }

        let mut work = Vec::with_capacity(positions.len());
        for position in positions.values() {
            let mut orders = orders_by_position.remove(&position.id).unwrap_or_default();
            for order in sync_with_venue(position, &mut orders, &venue_orders, now) {
                touched.insert(order.id, order);
            }
            work.push((position.clone(), orders));
        }

        let this = &*self;
        let outcomes: Vec<ProtectionOutcome> = stream::iter(work)
            .map(|(position, orders)| this.protect(position, orders, now))
            .buffer_unordered(this.max_concurrent)
            .collect()
            .await;

        let mut auth_seen = false;
        for outcome in outcomes {
            auth_seen |= outcome.auth_failed();
            Metrics::add(&self.ctx.metrics.protection_failures, outcome.failures.len() as u64);
            report.orders_placed += outcome.orders.iter().filter(|o| o.is_active()).count();

            if let Some(position) = positions.get_mut(&outcome.key) {
                if position.protection_status != outcome.status {
                    info!(
                        venue = %self.venue,
                        symbol = %position.symbol,
                        side = %position.side,
                        from = %position.protection_status,
                        to = %outcome.status,
                        "Protection status changed"
                    );
                    commit.protection.push(ProtectionUpdate {
                        position_id: position.id,
                        status: outcome.status,
                    });
                    position.protection_status = outcome.status;
                }
            }
            for order in outcome.orders {
                touched.insert(order.id, order);
            }
            report.failures.extend(outcome.failures);
        }

        report.actions = outcome.actions.len();
        report.discrepancies = outcome.discrepancies.len();
        commit.actions = outcome.actions;
        commit.synced = outcome.synced;
        commit.discrepancies = outcome.discrepancies;
        commit.orders = touched.into_values().collect();

        if !commit.is_empty() {
            if let Err(err) = self.ctx.ledger.commit_pass(&commit).await {
                Metrics::add(&self.ctx.metrics.ledger_failures, 1);
                self.record_auth(auth_seen);
                return self.ledger_failed(report, err);
            }
        }
        drop(guard);
        self.record_auth(auth_seen);

        Metrics::add(&self.ctx.metrics.passes, 1);
        Metrics::add(&self.ctx.metrics.reconcile_actions, report.actions as u64);
        Metrics::add(&self.ctx.metrics.discrepancies, report.discrepancies as u64);
        Metrics::add(&self.ctx.metrics.orders_placed, report.orders_placed as u64);

        let open: Vec<Position> = positions.into_values().collect();
        let coverage = coverage_of(&open, now);
        report.open = coverage.open as usize;
        report.fully_protected = coverage.fully_protected as usize;
        report.partially_protected = coverage.partially_protected as usize;
        report.unprotected = coverage.unprotected as usize;
        report.committed = true;

        // Grace periods and discrepancy streaks count full passes only
        if kind.is_full() {
            self.escalator.observe_discrepancies(&commit.discrepancies).await;
            self.escalator.observe_protection(&open).await;
            self.ctx.metrics.set_coverage(self.venue, coverage);
        }

        info!(
            venue = %self.venue,
            pass_id = %report.pass_id,
            kind = ?kind,
            actions = report.actions,
            discrepancies = report.discrepancies,
            orders_placed = report.orders_placed,
            failures = report.failures.len(),
            "Pass committed"
        );
        report
    }

    async fn protect(
        &self,
        position: Position,
        orders: Vec<ProtectiveOrder>,
        now: DateTime<Utc>,
    ) -> ProtectionOutcome {
        let mark = self.activation_mark(&position, &orders).await;
        let plan = plan(&position, &orders, self.executor.policy(), mark);
        self.executor.execute(&position, orders, plan, now).await
    }

    /// Mark price for trailing activation. Entry-referenced policies use the
    /// last reconciled mark; mark-referenced ones fetch it, only when a
    /// trailing stop may be placed.
    async fn activation_mark(
        &self,
        position: &Position,
        orders: &[ProtectiveOrder],
    ) -> Option<Decimal> {
        let policy = self.executor.policy();
        if !policy.trailing_enabled() {
            return None;
        }
        if policy.activation_reference != ActivationReference::Mark {
            return Some(position.mark_price);
        }
        let trailing_in_place = orders.iter().any(|o| {
            o.kind == OrderKind::TrailingStop && o.is_active() && o.quantity == position.quantity
        });
        if trailing_in_place {
            return None;
        }
        match self.connector.get_mark_price(&position.symbol).await {
            Ok(mark) => Some(mark),
            Err(err) => {
                debug!(
                    venue = %self.venue,
                    symbol = %position.symbol,
                    "Mark price unavailable, using last known: {}",
                    err
                );
                Some(position.mark_price)
            }
        }
    }

    /// Resolve the protective orders of a position the venue no longer holds
    async fn settle_closed(
        &self,
        position: &Position,
        orders: Vec<ProtectiveOrder>,
        venue_orders: &[VenueOrder],
        now: DateTime<Utc>,
    ) -> Vec<ProtectiveOrder> {
        let mut settled = Vec::new();
        for mut order in orders {
            match order.status {
                OrderStatus::Active => {
                    let resting = order
                        .venue_order_id
                        .clone()
                        .filter(|id| venue_orders.iter().any(|v| &v.venue_order_id == id));
                    match resting {
                        Some(venue_order_id) => {
                            match self.connector.cancel_order(&position.symbol, &venue_order_id).await {
                                Ok(_) => order.transition(OrderStatus::Cancelled, now),
                                Err(err) => {
                                    warn!(
                                        venue = %self.venue,
                                        symbol = %position.symbol,
                                        side = %position.side,
                                        kind = %order.kind,
                                        venue_order_id,
                                        failure_kind = %err.kind(),
                                        "Failed to cancel order of closed position: {}",
                                        err
                                    );
                                    continue;
                                }
                            }
                        }
                        // Gone with the position: it triggered
                        None => order.transition(OrderStatus::Filled, now),
                    }
                }
                OrderStatus::Pending => order.transition(OrderStatus::Cancelled, now),
                _ => continue,
            }
            debug!(
                venue = %self.venue,
                symbol = %position.symbol,
                kind = %order.kind,
                status = %order.status,
                "Protective order settled"
            );
            settled.push(order);
        }
        settled
    }

    fn record_auth(&mut self, auth_seen: bool) {
        if auth_seen {
            self.auth_failures += 1;
        } else {
            self.auth_failures = 0;
        }
    }

    fn fetch_failed(&mut self, report: CycleReport, operation: &str, err: ConnectorError) -> CycleReport {
        self.record_auth(err.is_fatal());
        Metrics::add(&self.ctx.metrics.pass_failures, 1);
        warn!(
            venue = %self.venue,
            pass_id = %report.pass_id,
            operation,
            failure_kind = %err.kind(),
            "Pass aborted, venue unavailable: {}",
            err
        );
        report.aborted(format!("{}: {}", operation, err))
    }

    fn ledger_failed(&self, report: CycleReport, err: WardenError) -> CycleReport {
        Metrics::add(&self.ctx.metrics.pass_failures, 1);
        error!(
            venue = %self.venue,
            pass_id = %report.pass_id,
            "Pass aborted, nothing committed: {}",
            err
        );
        report.aborted(err.to_string())
    }

    /// Start the loop (and the stream reader when enabled) on the runtime
    pub fn spawn(mut self, shutdown: watch::Receiver<bool>) -> (VenueHandle, JoinHandle<()>) {
        let venue = self.venue;
        let (force_tx, force_rx) = mpsc::channel(FORCE_QUEUE);
        let state = self.state.subscribe();
        let queue = Arc::new(EventQueue::new(self.queue_capacity));

        if self.stream_enabled {
            self.stream_task = Some(spawn_stream_reader(
                self.connector.clone(),
                queue.clone(),
                self.ctx.metrics.clone(),
                shutdown.clone(),
            ));
        }
        let scheduler = Scheduler::new(
            self.ctx.clock.clone(),
            self.poll_interval,
            queue,
            force_rx,
            shutdown,
        );
        let task = tokio::spawn(self.run(scheduler));

        (
            VenueHandle {
                venue,
                force_tx,
                state,
            },
            task,
        )
    }

    /// Drive passes until shutdown or a fatal authentication streak.
    /// An in-flight pass always runs to its commit.
    pub async fn run(mut self, mut scheduler: Scheduler) {
        info!(venue = %self.venue, interval_secs = self.poll_interval.as_secs(), "Venue loop started");

        loop {
            match scheduler.next().await {
                Wake::Shutdown => break,
                Wake::Poll => {
                    self.run_pass(PassKind::Full, None).await;
                    scheduler.full_pass_done();
                    self.ctx.locks.prune();
                }
                Wake::Events(events) => {
                    let keys: BTreeSet<PositionKey> = events
                        .iter()
                        .filter(|e| e.venue == self.venue)
                        .map(|e| e.key())
                        .collect();
                    if keys.is_empty() {
                        continue;
                    }
                    debug!(venue = %self.venue, keys = keys.len(), "Stream events, scoped pass");
                    self.run_pass(PassKind::Scoped, Some(keys)).await;
                }
                Wake::Forced(reply) => {
                    let report = self.run_pass(PassKind::Forced, None).await;
                    scheduler.full_pass_done();
                    let _ = reply.send(report);
                }
            }

            if self.auth_failures >= self.max_auth_failures {
                let reason = format!(
                    "{} consecutive passes failed authentication",
                    self.auth_failures
                );
                error!(venue = %self.venue, "Venue loop halted: {}", reason);
                self.ctx.alerts.venue_halted(self.venue.as_str(), &reason).await;
                self.stop_stream();
                self.state.send_replace(LoopState::Halted(reason));
                return;
            }
        }

        self.stop_stream();
        self.state.send_replace(LoopState::Stopped);
        info!(venue = %self.venue, "Venue loop stopped");
    }

    fn stop_stream(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
    }
}

fn spawn_stream_reader(
    connector: Arc<dyn VenueConnector>,
    queue: Arc<EventQueue>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let venue = connector.venue();
        let mut events = connector.stream_position_events();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.next() => match event {
                    Some(event) => {
                        Metrics::add(&metrics.stream_events, 1);
                        if queue.push(event) {
                            Metrics::add(&metrics.stream_events_dropped, 1);
                            debug!(venue = %venue, "Event queue full, dropped oldest");
                        }
                    }
                    None => {
                        warn!(venue = %venue, "Position stream ended; relying on polling");
                        break;
                    }
                }
            }
        }
    })
}

/// Line up ledger orders of an open position with what rests on the venue.
///
/// ACTIVE records the venue no longer holds were cancelled externally. Venue
/// orders the ledger lacks are matched to an unconfirmed record by client id,
/// or adopted when no active order of that kind exists. Returns changed records.
pub fn sync_with_venue(
    position: &Position,
    orders: &mut Vec<ProtectiveOrder>,
    venue_orders: &[VenueOrder],
    now: DateTime<Utc>,
) -> Vec<ProtectiveOrder> {
    let resting: Vec<&VenueOrder> = venue_orders
        .iter()
        .filter(|v| v.symbol == position.symbol && v.position_side == position.side)
        .collect();
    let mut changed = Vec::new();

    for order in orders.iter_mut().filter(|o| o.is_active()) {
        let still_resting = order
            .venue_order_id
            .as_ref()
            .map_or(false, |id| resting.iter().any(|v| &v.venue_order_id == id));
        if !still_resting {
            warn!(
                venue = %position.venue,
                symbol = %position.symbol,
                side = %position.side,
                kind = %order.kind,
                venue_order_id = ?order.venue_order_id,
                "Active protective order missing on venue, marking cancelled"
            );
            order.transition(OrderStatus::Cancelled, now);
            changed.push(order.clone());
        }
    }

    for venue_order in resting {
        let known = orders
            .iter()
            .any(|o| o.venue_order_id.as_deref() == Some(venue_order.venue_order_id.as_str()));
        if known {
            continue;
        }

        let unconfirmed = venue_order.client_order_id.as_deref().and_then(|client_id| {
            orders.iter_mut().find(|o| {
                o.idempotency_key == client_id
                    && matches!(o.status, OrderStatus::Pending | OrderStatus::Rejected)
            })
        });
        if let Some(order) = unconfirmed {
            order.venue_order_id = Some(venue_order.venue_order_id.clone());
            order.trigger = venue_order.trigger;
            order.quantity = venue_order.quantity;
            order.reject_reason = None;
            order.transition(OrderStatus::Active, now);
            info!(
                venue = %position.venue,
                symbol = %position.symbol,
                kind = %order.kind,
                venue_order_id = %venue_order.venue_order_id,
                "Unconfirmed protective order found resting on venue"
            );
            changed.push(order.clone());
            continue;
        }

        if orders.iter().any(|o| o.kind == venue_order.kind && o.is_active()) {
            debug!(
                venue = %position.venue,
                symbol = %position.symbol,
                venue_order_id = %venue_order.venue_order_id,
                "Ignoring extra venue order of an already protected kind"
            );
            continue;
        }

        let adopted = ProtectiveOrder::adopted(position.id, venue_order, now);
        info!(
            venue = %position.venue,
            symbol = %position.symbol,
            side = %position.side,
            kind = %adopted.kind,
            venue_order_id = %venue_order.venue_order_id,
            "Adopted protective order found on venue"
        );
        orders.push(adopted.clone());
        changed.push(adopted);
    }

    changed
}

fn coverage_of(open: &[Position], now: DateTime<Utc>) -> VenueCoverage {
    let mut coverage = VenueCoverage {
        open: open.len() as u64,
        last_pass_at: Some(now),
        ..VenueCoverage::default()
    };
    for position in open {
        match position.protection_status {
            ProtectionStatus::FullyProtected => coverage.fully_protected += 1,
            ProtectionStatus::PartiallyProtected => coverage.partially_protected += 1,
            status if !status.has_active_stop() => coverage.unprotected += 1,
            _ => {}
        }
    }
    coverage
}

/// Control surface of a spawned venue loop
#[derive(Clone)]
pub struct VenueHandle {
    pub venue: Venue,
    force_tx: mpsc::Sender<ForceRequest>,
    state: watch::Receiver<LoopState>,
}

impl VenueHandle {
    /// Run a full pass now and wait for its report
    pub async fn force_pass(&self) -> Result<CycleReport> {
        let not_running = || WardenError::Halted(format!("{} loop is not running", self.venue));
        let (reply_tx, reply_rx) = oneshot::channel();
        self.force_tx.send(reply_tx).await.map_err(|_| not_running())?;
        reply_rx.await.map_err(|_| not_running())
    }

    pub fn state(&self) -> LoopState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }
}
