//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, sync status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{PollingScheduler, SyncEngine};
use crate::domain::connection::{ConnectionPhase, ConnectionState};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::push::PushClient;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Push channel state.
    pub push: ConnectionState,
    /// Reconciler and registry counters. Absent if the engine stopped.
    pub sync: Option<SyncStatus>,
    /// Number of poll tasks.
    pub poll_tasks: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Push channel open and engine running.
    Healthy,
    /// Engine running on polling alone.
    Degraded,
    /// Engine stopped or push channel closed.
    Unhealthy,
}

/// Engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    /// Keys with an authoritative value.
    pub tracked_keys: usize,
    /// Accepted updates.
    pub accepted: u64,
    /// Rejected older updates.
    pub stale: u64,
    /// Rejected ties.
    pub duplicate: u64,
    /// Live subscriptions.
    pub subscriptions: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    engine: SyncEngine,
    push: Arc<PushClient>,
    scheduler: Arc<PollingScheduler>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        engine: SyncEngine,
        push: Arc<PushClient>,
        scheduler: Arc<PollingScheduler>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            engine,
            push,
            scheduler,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state).await;
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let push = state.push.state();
    let sync = state.engine.stats().await.ok().map(|stats| SyncStatus {
        tracked_keys: stats.reconciler.keys,
        accepted: stats.reconciler.accepted,
        stale: stats.reconciler.stale,
        duplicate: stats.reconciler.duplicate,
        subscriptions: stats.subscriptions.subscription_count,
    });

    HealthResponse {
        status: determine_health_status(push.phase, sync.is_some()),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        push,
        sync,
        poll_tasks: state.scheduler.scheduled_keys().len(),
    }
}

const fn determine_health_status(phase: ConnectionPhase, engine_running: bool) -> HealthStatus {
    if !engine_running {
        return HealthStatus::Unhealthy;
    }
    match phase {
        ConnectionPhase::Open => HealthStatus::Healthy,
        ConnectionPhase::Idle | ConnectionPhase::Connecting | ConnectionPhase::Backoff => {
            HealthStatus::Degraded
        }
        ConnectionPhase::Closed => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
