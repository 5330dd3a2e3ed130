//! Status HTTP server
//!
//! Liveness and protection status for process supervision, Prometheus
//! metrics, and an operator trigger for an immediate pass.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::domain::Venue;
use crate::error::WardenError;
use crate::monitor::LoopState;
use crate::supervisor::{AlertLevel, Engine};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct VenueHealth {
    pub venue: Venue,
    pub state: Option<LoopState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub venues: Vec<VenueHealth>,
    pub critical_alerts: usize,
}

pub struct StatusState {
    pub engine: Arc<Engine>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VenueFilter {
    pub venue: Option<Venue>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let state = Arc::new(StatusState {
        engine,
        started_at: Utc::now(),
    });
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/status", get(status_handler))
        .route("/summary", get(summary_handler))
        .route("/metrics", get(metrics_handler))
        .route("/reconcile", post(reconcile_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the engine's shutdown is requested
pub async fn serve(engine: Arc<Engine>, port: u16) -> crate::error::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Status server listening on {}", addr);

    let shutdown = engine.clone();
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown_request().await })
        .await
        .map_err(|e| WardenError::Internal(format!("Status server error: {}", e)))
}

struct ApiError(WardenError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WardenError::Halted(_) | WardenError::InvalidState(_) => StatusCode::CONFLICT,
            WardenError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("Status request failed: {}", self.0);
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        ApiError(err)
    }
}

async fn health_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    let loop_states = state.engine.loop_states().await;
    let venues: Vec<VenueHealth> = state
        .engine
        .venues()
        .into_iter()
        .map(|venue| VenueHealth {
            venue,
            state: loop_states.get(&venue).cloned(),
        })
        .collect();
    let critical_alerts = state
        .engine
        .alerts()
        .active_alerts()
        .await
        .iter()
        .filter(|a| a.level == AlertLevel::Critical)
        .count();

    let any_halted = venues
        .iter()
        .any(|v| !matches!(v.state, Some(LoopState::Running)));
    let status = if any_halted {
        HealthStatus::Unhealthy
    } else if critical_alerts > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    let code = match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    let now = Utc::now();
    (
        code,
        Json(HealthResponse {
            status,
            timestamp: now,
            uptime_seconds: (now - state.started_at).num_seconds(),
            venues,
            critical_alerts,
        }),
    )
}

async fn status_handler(
    State(state): State<Arc<StatusState>>,
    Query(filter): Query<VenueFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.protection_status(filter.venue).await?))
}

async fn summary_handler(State(state): State<Arc<StatusState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.summary().await?))
}

async fn metrics_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.engine.metrics().prometheus(),
    )
}

async fn reconcile_handler(
    State(state): State<Arc<StatusState>>,
    Query(filter): Query<VenueFilter>,
) -> Result<impl IntoResponse, ApiError> {
    info!(venue = ?filter.venue, "Forced pass requested over HTTP");
    Ok(Json(state.engine.force_pass(filter.venue).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::coordination::SystemClock;
    use crate::exchange::{PaperVenue, VenueConnector};
    use crate::ledger::InMemoryLedger;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn engine() -> Arc<Engine> {
        let mut config = AppConfig::default_config();
        config.monitor.stream_enabled = false;
        Arc::new(Engine::with_parts(
            config,
            Arc::new(InMemoryLedger::new()),
            vec![Arc::new(PaperVenue::new()) as Arc<dyn VenueConnector>],
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test]
    async fn healthz_is_unavailable_before_loops_start() {
        let response = router(engine())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn summary_and_metrics_respond() {
        let app = router(engine());
        let summary = app
            .clone()
            .oneshot(Request::get("/summary").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(summary.status(), StatusCode::OK);

        let metrics = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        let body = axum::body::to_bytes(metrics.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("warden_passes_total"));
    }

    #[tokio::test]
    async fn reconcile_without_running_loops_conflicts() {
        let response = router(engine())
            .oneshot(Request::post("/reconcile").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn reconcile_runs_a_pass_on_running_loops() {
        let engine = engine();
        engine.start().await.unwrap();

        let response = router(engine.clone())
            .oneshot(
                Request::post("/reconcile?venue=paper")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        engine
            .shutdown(crate::coordination::ShutdownSignal::Requested)
            .await
            .unwrap();
    }
}
