//! Venue loop cadence, forced passes, shutdown and failure handling.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_test::{assert_err, assert_ok};

use warden::config::AppConfig;
use warden::coordination::ManualClock;
use warden::domain::{
    EntryFill, OrderHandle, OrderKind, OrderStatus, PositionEvent, PositionStatus,
    ProtectiveOrderSpec, RemotePosition, Side, Venue, VenueOrder,
};
use warden::error::{ConnectorError, WardenError};
use warden::exchange::{ConnectorResult, PaperOp, PaperVenue, VenueConnector};
use warden::ledger::{register_entry, InMemoryLedger, KeyLocks, Ledger};
use warden::monitor::{LoopState, MonitorContext, PassKind, VenueMonitor};
use warden::services::Metrics;
use warden::supervisor::{AlertLevel, AlertManager};

struct Fixture {
    venue: Arc<PaperVenue>,
    ledger: Arc<InMemoryLedger>,
    locks: Arc<KeyLocks>,
    clock: Arc<ManualClock>,
    alerts: Arc<AlertManager>,
    metrics: Arc<Metrics>,
    monitor: VenueMonitor,
}

fn fixture(stream_enabled: bool) -> Fixture {
    let venue = Arc::new(PaperVenue::new());
    fixture_over(venue.clone(), venue, stream_enabled)
}

fn fixture_over(
    venue: Arc<PaperVenue>,
    connector: Arc<dyn VenueConnector>,
    stream_enabled: bool,
) -> Fixture {
    let mut config = AppConfig::default_config();
    config.monitor.stream_enabled = stream_enabled;
    config.monitor.poll_interval_seconds = 30;
    config.monitor.max_auth_failures = 3;

    let ledger = Arc::new(InMemoryLedger::new());
    let locks = Arc::new(KeyLocks::new());
    let clock = Arc::new(ManualClock::default());
    let alerts = Arc::new(AlertManager::with_defaults());
    let metrics = Arc::new(Metrics::new());
    let ctx = MonitorContext {
        ledger: ledger.clone(),
        locks: locks.clone(),
        clock: clock.clone(),
        alerts: alerts.clone(),
        metrics: metrics.clone(),
    };
    let monitor = VenueMonitor::new(connector, ctx, &config);
    Fixture {
        venue,
        ledger,
        locks,
        clock,
        alerts,
        metrics,
        monitor,
    }
}

/// Paper venue that runs a hook once, right after taking the position snapshot
struct HookedVenue {
    inner: Arc<PaperVenue>,
    after_snapshot: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl HookedVenue {
    fn new(inner: Arc<PaperVenue>) -> Self {
        Self {
            inner,
            after_snapshot: Mutex::new(None),
        }
    }

    fn after_snapshot(&self, hook: impl std::future::Future<Output = ()> + Send + 'static) {
        *self.after_snapshot.lock().unwrap() = Some(hook.boxed());
    }
}

#[async_trait]
impl VenueConnector for HookedVenue {
    fn venue(&self) -> Venue {
        self.inner.venue()
    }

    async fn list_positions(&self) -> ConnectorResult<Vec<RemotePosition>> {
        let snapshot = self.inner.list_positions().await?;
        let hook = self.after_snapshot.lock().unwrap().take();
        if let Some(hook) = hook {
            hook.await;
        }
        Ok(snapshot)
    }

    async fn get_mark_price(&self, symbol: &str) -> ConnectorResult<Decimal> {
        self.inner.get_mark_price(symbol).await
    }

    async fn place_protective_order(
        &self,
        spec: &ProtectiveOrderSpec,
    ) -> ConnectorResult<OrderHandle> {
        self.inner.place_protective_order(spec).await
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> ConnectorResult<bool> {
        self.inner.cancel_order(symbol, venue_order_id).await
    }

    async fn list_protective_orders(&self) -> ConnectorResult<Vec<VenueOrder>> {
        self.inner.list_protective_orders().await
    }

    fn stream_position_events(&self) -> BoxStream<'static, PositionEvent> {
        self.inner.stream_position_events()
    }
}

async fn wait_for_count(counter: &AtomicU64, expected: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while Metrics::get(counter) < expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("counter never reached the expected value");
}

#[tokio::test]
async fn full_passes_follow_the_poll_interval() {
    let f = fixture(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, task) = f.monitor.spawn(shutdown_rx);

    wait_for_count(&f.metrics.passes, 1).await;
    f.clock.wait_for_sleepers(1).await;
    assert_eq!(Metrics::get(&f.metrics.passes), 1);

    f.clock.advance(Duration::from_secs(29));
    tokio::task::yield_now().await;
    assert_eq!(Metrics::get(&f.metrics.passes), 1);

    f.clock.advance(Duration::from_secs(1));
    wait_for_count(&f.metrics.passes, 2).await;

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(handle.state(), LoopState::Stopped);
}

#[tokio::test]
async fn forced_pass_reports_back_without_waiting_for_the_timer() {
    let f = fixture(false);
    f.venue
        .set_position("BTCUSDT", Side::Long, dec!(0.5), dec!(100000));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, task) = f.monitor.spawn(shutdown_rx);

    wait_for_count(&f.metrics.passes, 1).await;
    let report = assert_ok!(handle.force_pass().await);
    assert_eq!(report.kind, PassKind::Forced);
    assert!(report.committed);
    assert_eq!(report.open, 1);
    assert_eq!(report.fully_protected, 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    let err = assert_err!(handle.force_pass().await);
    assert!(matches!(err, WardenError::Halted(_)));
}

#[tokio::test]
async fn stream_event_triggers_scoped_pass_before_the_timer() {
    let f = fixture(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_handle, task) = f.monitor.spawn(shutdown_rx);

    wait_for_count(&f.metrics.passes, 1).await;
    f.clock.wait_for_sleepers(1).await;

    f.venue
        .set_position("ETHUSDT", Side::Short, dec!(2), dec!(4000));
    wait_for_count(&f.metrics.passes, 2).await;

    let open = f.ledger.open_positions(Venue::Paper).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].symbol, "ETHUSDT");
    assert!(Metrics::get(&f.metrics.stream_events) >= 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn repeated_auth_failures_halt_the_venue() {
    let f = fixture(false);
    f.venue.fail_next(
        (0..3).map(|_| ConnectorError::AuthFailure("invalid api key".into())),
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, task) = f.monitor.spawn(shutdown_rx);

    // The loop opens with a timed pass; two forced passes complete the streak
    for _ in 0..2 {
        let report = handle.force_pass().await.unwrap();
        assert!(!report.is_ok());
    }
    task.await.unwrap();

    assert!(matches!(handle.state(), LoopState::Halted(_)));
    let alerts = f.alerts.active_alerts().await;
    assert!(alerts
        .iter()
        .any(|a| a.level == AlertLevel::Critical && a.key == "halted:paper"));
    assert_err!(handle.force_pass().await);
}

#[tokio::test]
async fn ledger_failure_aborts_the_pass_and_next_pass_adopts_orders() {
    let mut f = fixture(false);
    f.venue
        .set_position("BTCUSDT", Side::Long, dec!(0.5), dec!(100000));
    f.ledger.fail_next_commits(1);

    let aborted = f.monitor.run_pass(PassKind::Full, None).await;
    assert!(!aborted.committed);
    assert!(aborted.error.is_some());
    assert!(f.ledger.open_positions(Venue::Paper).await.unwrap().is_empty());
    assert_eq!(Metrics::get(&f.metrics.ledger_failures), 1);
    let placed = f.venue.calls(PaperOp::Place);
    assert_eq!(f.venue.open_orders().len(), 2);

    let recovered = f.monitor.run_pass(PassKind::Full, None).await;
    assert!(recovered.committed);
    assert_eq!(recovered.fully_protected, 1);
    assert_eq!(f.venue.calls(PaperOp::Place), placed);
    assert_eq!(
        f.venue.open_orders_for("BTCUSDT", OrderKind::StopLoss).len(),
        1
    );

    let open = f.ledger.open_positions(Venue::Paper).await.unwrap();
    let orders = f.ledger.orders_for(&[open[0].id]).await.unwrap();
    assert_eq!(
        orders
            .iter()
            .filter(|o| o.status == OrderStatus::Active)
            .count(),
        2
    );
}

#[tokio::test]
async fn entry_recorded_after_the_snapshot_is_not_closed() {
    let paper = Arc::new(PaperVenue::new());
    let hooked = Arc::new(HookedVenue::new(paper.clone()));
    let mut f = fixture_over(paper.clone(), hooked.clone(), false);

    let (ledger, locks, venue) = (f.ledger.clone(), f.locks.clone(), paper.clone());
    hooked.after_snapshot(async move {
        venue.set_position("BTCUSDT", Side::Long, dec!(1), dec!(100000));
        let fill = EntryFill {
            venue: Venue::Paper,
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: dec!(1),
            entry_price: dec!(100000),
            opened_at: Utc::now(),
            leverage: Some(10),
        };
        register_entry(&*ledger, &locks, &fill, Utc::now())
            .await
            .unwrap();
    });

    let first = f.monitor.run_pass(PassKind::Full, None).await;
    assert!(first.is_ok(), "{:?}", first.error);
    assert_eq!(first.actions, 0);

    let open = f.ledger.open_positions(Venue::Paper).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, PositionStatus::Open);
    let id = open[0].id;

    let second = f.monitor.run_pass(PassKind::Full, None).await;
    assert_eq!(second.actions, 0);
    assert_eq!(second.fully_protected, 1);
    let open = f.ledger.open_positions(Venue::Paper).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, id);
}

#[tokio::test]
async fn shutdown_during_a_pass_lets_it_commit() {
    let paper = Arc::new(PaperVenue::new());
    paper.set_position("BTCUSDT", Side::Long, dec!(0.5), dec!(100000));
    let hooked = Arc::new(HookedVenue::new(paper.clone()));
    let f = fixture_over(paper.clone(), hooked.clone(), false);

    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    hooked.after_snapshot(async move {
        let _ = entered_tx.send(());
        let _ = release_rx.await;
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, task) = f.monitor.spawn(shutdown_rx);

    entered_rx.await.unwrap();
    shutdown_tx.send(true).unwrap();
    release_tx.send(()).unwrap();
    task.await.unwrap();

    assert_eq!(handle.state(), LoopState::Stopped);
    assert_eq!(Metrics::get(&f.metrics.passes), 1);
    let open = f.ledger.open_positions(Venue::Paper).await.unwrap();
    assert_eq!(open.len(), 1);
    let orders = f.ledger.orders_for(&[open[0].id]).await.unwrap();
    assert_eq!(
        orders
            .iter()
            .filter(|o| o.status == OrderStatus::Active)
            .count(),
        2
    );
    assert_eq!(paper.open_orders().len(), 2);
}
