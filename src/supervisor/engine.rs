//! Engine assembly and operator surface
//!
//! Builds one guarded connector and one monitor loop per enabled venue over a
//! shared ledger, and exposes the queries and triggers operators use:
//! per-position protection status, summary coverage, forced passes, audits
//! and entry registration.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::AlertManager;
use crate::config::AppConfig;
use crate::coordination::{
    CircuitBreakerStats, Clock, GracefulShutdown, ShutdownError, ShutdownSignal, SystemClock,
};
use crate::domain::{
    EntryFill, OrderKind, Position, ProtectionStatus, ProtectiveOrder, Side, Trigger, Venue,
};
use crate::error::{Result, WardenError};
use crate::exchange::{build_venue_connector, guard_connector, GuardedConnector, VenueConnector};
use crate::ledger::{open_ledger, register_entry, KeyLocks, Ledger, PositionQuery};
use crate::monitor::{CycleReport, LoopState, MonitorContext, VenueHandle, VenueMonitor};
use crate::reconciliation::{audit_venue, AuditReport, Tolerances};
use crate::services::Metrics;

/// Active protective order as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOrderView {
    pub kind: OrderKind,
    pub trigger: Trigger,
    pub quantity: rust_decimal::Decimal,
    pub venue_order_id: Option<String>,
}

impl From<&ProtectiveOrder> for ActiveOrderView {
    fn from(order: &ProtectiveOrder) -> Self {
        Self {
            kind: order.kind,
            trigger: order.trigger,
            quantity: order.quantity,
            venue_order_id: order.venue_order_id.clone(),
        }
    }
}

/// Per-position protection view
#[derive(Debug, Clone, Serialize)]
pub struct PositionProtection {
    pub position_id: Uuid,
    pub symbol: String,
    pub venue: Venue,
    pub side: Side,
    pub quantity: rust_decimal::Decimal,
    pub entry_price: rust_decimal::Decimal,
    pub protection_status: ProtectionStatus,
    pub active_orders: Vec<ActiveOrderView>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VenueSummary {
    pub venue: Venue,
    pub loop_state: Option<LoopState>,
    pub open: usize,
    pub fully_protected: usize,
    pub partially_protected: usize,
    pub unprotected: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProtectionSummary {
    pub open: usize,
    pub fully_protected: usize,
    pub partially_protected: usize,
    /// Open positions without an active stop-loss
    pub unprotected: usize,
    pub venues: Vec<VenueSummary>,
}

impl ProtectionSummary {
    fn count(&mut self, status: ProtectionStatus) {
        self.open += 1;
        match status {
            ProtectionStatus::FullyProtected => self.fully_protected += 1,
            ProtectionStatus::PartiallyProtected => self.partially_protected += 1,
            s if !s.has_active_stop() => self.unprotected += 1,
            _ => {}
        }
    }
}

pub struct Engine {
    config: AppConfig,
    ctx: MonitorContext,
    connectors: Vec<Arc<GuardedConnector>>,
    handles: RwLock<Vec<VenueHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<GracefulShutdown>,
}

impl Engine {
    /// Open the configured ledger and connect every enabled venue
    pub async fn build(config: AppConfig) -> Result<Self> {
        let ledger = open_ledger(&config.ledger).await?;
        let connectors = config
            .enabled_venues()
            .map(build_venue_connector)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_parts(config, ledger, connectors, Arc::new(SystemClock)))
    }

    /// Assemble from explicit parts; connectors are wrapped in their breaker here
    pub fn with_parts(
        config: AppConfig,
        ledger: Arc<dyn Ledger>,
        connectors: Vec<Arc<dyn VenueConnector>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ctx = MonitorContext {
            ledger,
            locks: Arc::new(KeyLocks::new()),
            clock: clock.clone(),
            alerts: Arc::new(AlertManager::with_defaults()),
            metrics: Arc::new(Metrics::new()),
        };
        let connectors = connectors
            .into_iter()
            .map(|inner| guard_connector(inner, &config, clock.clone(), ctx.alerts.clone()))
            .collect();
        let shutdown = Arc::new(GracefulShutdown::new(config.monitor.shutdown_timeout()));

        Self {
            config,
            ctx,
            connectors,
            handles: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ctx.ledger.clone()
    }

    pub fn alerts(&self) -> Arc<AlertManager> {
        self.ctx.alerts.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.metrics.clone()
    }

    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    pub fn venues(&self) -> Vec<Venue> {
        self.connectors.iter().map(|c| c.venue()).collect()
    }

    /// Spawn one monitor loop per venue. Calling again is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.write().await;
        if !handles.is_empty() {
            return Ok(());
        }
        if self.shutdown.is_shutdown_requested() {
            return Err(WardenError::InvalidState("engine is shutting down".to_string()));
        }

        let mut tasks = self.tasks.lock().await;
        for connector in &self.connectors {
            let monitor = VenueMonitor::new(connector.clone(), self.ctx.clone(), &self.config);
            let (handle, task) = monitor.spawn(self.shutdown.watcher());
            info!(venue = %handle.venue, "Venue monitor spawned");
            handles.push(handle);
            tasks.push(task);
        }
        Ok(())
    }

    pub async fn loop_states(&self) -> HashMap<Venue, LoopState> {
        self.handles
            .read()
            .await
            .iter()
            .map(|h| (h.venue, h.state()))
            .collect()
    }

    /// Protection view of open positions, optionally for one venue
    pub async fn protection_status(&self, venue: Option<Venue>) -> Result<Vec<PositionProtection>> {
        let mut query = PositionQuery::open();
        query.venue = venue;
        let positions = self.ctx.ledger.positions(query).await?;
        let ids: Vec<Uuid> = positions.iter().map(|p| p.id).collect();
        let orders = self.ctx.ledger.orders_for(&ids).await?;

        Ok(positions
            .into_iter()
            .map(|position| {
                let active_orders = orders
                    .iter()
                    .filter(|o| o.position_id == position.id && o.is_active())
                    .map(ActiveOrderView::from)
                    .collect();
                to_view(position, active_orders)
            })
            .collect())
    }

    /// Coverage counts across all venues, from committed ledger state
    pub async fn summary(&self) -> Result<ProtectionSummary> {
        let positions = self.ctx.ledger.positions(PositionQuery::open()).await?;
        let states = self.loop_states().await;

        let mut summary = ProtectionSummary::default();
        let mut per_venue: HashMap<Venue, ProtectionSummary> = HashMap::new();
        for position in &positions {
            summary.count(position.protection_status);
            per_venue
                .entry(position.venue)
                .or_default()
                .count(position.protection_status);
        }

        for venue in self.venues() {
            let counts = per_venue.remove(&venue).unwrap_or_default();
            summary.venues.push(VenueSummary {
                venue,
                loop_state: states.get(&venue).cloned(),
                open: counts.open,
                fully_protected: counts.fully_protected,
                partially_protected: counts.partially_protected,
                unprotected: counts.unprotected,
            });
        }
        Ok(summary)
    }

    /// Run a full pass now on one venue, or on every running venue
    pub async fn force_pass(&self, venue: Option<Venue>) -> Result<Vec<CycleReport>> {
        let handles: Vec<VenueHandle> = self
            .handles
            .read()
            .await
            .iter()
            .filter(|h| venue.map_or(true, |v| h.venue == v))
            .cloned()
            .collect();
        if handles.is_empty() {
            return Err(WardenError::InvalidState(match venue {
                Some(v) => format!("no running loop for {}", v),
                None => "no venue loops running".to_string(),
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            reports.push(handle.force_pass().await?);
        }
        Ok(reports)
    }

    /// Diff the ledger against venues without protecting anything
    pub async fn audit(&self, venue: Option<Venue>, apply: bool) -> Result<Vec<AuditReport>> {
        let tolerances = Tolerances::from(&self.config.reconciliation);
        let mut reports = Vec::new();
        for connector in &self.connectors {
            if venue.map_or(false, |v| v != connector.venue()) {
                continue;
            }
            let report = audit_venue(
                connector.as_ref(),
                self.ctx.ledger.as_ref(),
                &self.ctx.locks,
                &tolerances,
                apply,
                self.ctx.clock.now(),
            )
            .await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Register a committed entry fill from the order-placement subsystem
    pub async fn record_entry(&self, entry: &EntryFill) -> Result<Position> {
        if !self.venues().contains(&entry.venue) {
            return Err(WardenError::Validation(format!(
                "venue {} is not enabled",
                entry.venue
            )));
        }
        register_entry(
            self.ctx.ledger.as_ref(),
            &self.ctx.locks,
            entry,
            self.ctx.clock.now(),
        )
        .await
    }

    pub async fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats = Vec::with_capacity(self.connectors.len());
        for connector in &self.connectors {
            stats.push(connector.breaker().get_stats().await);
        }
        stats
    }

    /// Resolves once shutdown is requested, e.g. by a signal handler
    pub async fn wait_for_shutdown_request(&self) {
        let mut watcher = self.shutdown.watcher();
        while !*watcher.borrow() {
            if watcher.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop all loops. Each finishes and commits its in-flight pass; whatever
    /// is still running at the ceiling is aborted.
    pub async fn shutdown(&self, signal: ShutdownSignal) -> std::result::Result<(), ShutdownError> {
        self.shutdown.request_shutdown(signal);

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let drained = self
            .shutdown
            .execute(async {
                join_loops(&mut tasks).await;
            })
            .await;

        if drained.is_err() {
            let outstanding: Vec<&JoinHandle<()>> =
                tasks.iter().filter(|t| !t.is_finished()).collect();
            warn!(aborted = outstanding.len(), "Venue loops aborted at shutdown ceiling");
            for task in outstanding {
                task.abort();
            }
        }
        drained
    }
}

/// Wait for every venue loop; returns how many ended abnormally
async fn join_loops(tasks: &mut [JoinHandle<()>]) -> usize {
    let mut crashed = 0;
    for task in tasks.iter_mut() {
        if let Err(err) = task.await {
            crashed += 1;
            error!(panicked = err.is_panic(), "Venue loop ended abnormally: {}", err);
        }
    }
    crashed
}

fn to_view(position: Position, active_orders: Vec<ActiveOrderView>) -> PositionProtection {
    PositionProtection {
        position_id: position.id,
        symbol: position.symbol,
        venue: position.venue,
        side: position.side,
        quantity: position.quantity,
        entry_price: position.entry_price,
        protection_status: position.protection_status,
        active_orders,
        last_synced_at: position.last_synced_at,
    }
}
