//! Graceful Shutdown Handler
//!
//! Venue loops observe the shutdown watch, finish and commit their in-flight
//! cycle, then exit. A hard ceiling bounds the whole drain; whatever is still
//! running afterwards is aborted by the caller.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Operator-requested stop (API, CLI)
    Requested,
    /// A venue loop halted on a fatal error
    Fatal,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Requested => write!(f, "requested"),
            ShutdownSignal::Fatal => write!(f, "fatal"),
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Waiting for venue loops to commit their in-flight cycle
    DrainingLoops,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::DrainingLoops => write!(f, "draining_loops"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    timeout: Duration,
    shutdown_requested: AtomicBool,
    requested_tx: watch::Sender<bool>,
    phase: watch::Sender<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new(timeout: Duration) -> Self {
        let (requested_tx, _) = watch::channel(false);
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);

        Self {
            timeout,
            shutdown_requested: AtomicBool::new(false),
            requested_tx,
            phase,
            signal_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(10))
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    /// Level-triggered view for loops: flips to `true` once and stays there
    pub fn watcher(&self) -> watch::Receiver<bool> {
        self.requested_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.requested_tx.send_replace(true);
        let _ = self.signal_tx.send(signal);
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Drive `drain` to completion within the hard ceiling.
    ///
    /// Returns `Err(ShutdownError::Timeout)` when the ceiling fires; the
    /// drain future is dropped at that point.
    pub async fn execute<F>(&self, drain: F) -> Result<(), ShutdownError>
    where
        F: Future<Output = ()>,
    {
        let start = std::time::Instant::now();
        self.set_phase(ShutdownPhase::DrainingLoops);

        let result = match tokio::time::timeout(self.timeout, drain).await {
            Ok(()) => {
                info!("Graceful shutdown completed in {:?}", start.elapsed());
                Ok(())
            }
            Err(_) => {
                error!(
                    "Shutdown ceiling of {}s exceeded, aborting outstanding work",
                    self.timeout.as_secs()
                );
                Err(ShutdownError::Timeout)
            }
        };

        self.set_phase(ShutdownPhase::Complete);
        result
    }
}

/// Shutdown errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// Shutdown timed out
    Timeout,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Helper to install OS signal handlers
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_sigterm = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("Received SIGTERM");
                    shutdown_sigterm.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        });
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C");
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_display() {
        assert_eq!(ShutdownSignal::Graceful.to_string(), "graceful");
        assert_eq!(ShutdownSignal::Fatal.to_string(), "fatal");
        assert_eq!(ShutdownPhase::DrainingLoops.to_string(), "draining_loops");
    }

    #[tokio::test]
    async fn test_shutdown_request_flips_watcher_once() {
        let shutdown = GracefulShutdown::with_defaults();
        let watcher = shutdown.watcher();
        assert!(!*watcher.borrow());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(shutdown.is_shutdown_requested());
        assert!(*watcher.borrow());

        // Duplicate request should be ignored
        shutdown.request_shutdown(ShutdownSignal::Requested);
        assert!(shutdown.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_execute_completes_within_ceiling() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        assert!(shutdown.execute(async {}).await.is_ok());
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let shutdown = GracefulShutdown::new(Duration::from_millis(50));
        let result = shutdown
            .execute(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert_eq!(result, Err(ShutdownError::Timeout));
    }
}
