#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Live Sync - Dashboard Data Synchronization Core
//!
//! Keeps dashboard values fresh from two producers: a persistent WebSocket
//! push channel and recurring HTTP polls. Both feed one reconciler that
//! holds a single authoritative value per logical key and fans accepted
//! values out to subscribers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure synchronization rules
//!   - `connection`: Push channel state machine and backoff
//!   - `reconciler`: Timestamp-ordered acceptance of updates
//!   - `subscription`: Per-key subscriber registry
//!   - `update`: Keys, values and authoritative state
//!
//! - **Application**: Services and port definitions
//!   - `ports`: Fetcher, update sink and error sink contracts
//!   - `services`: Sync engine and polling scheduler
//!
//! - **Infrastructure**: Adapters and operational surface
//!   - `push`: WebSocket client, codec and keepalive
//!   - `http`: REST endpoints and the HTTP fetcher
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! WebSocket ──► PushClient ──┐
//!                            ├──► SyncEngine ──► Reconciler ──► Subscribers
//! REST ──► PollingScheduler ─┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core synchronization types with no I/O.
pub mod domain;

/// Application layer - Services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{
    BackoffConfig, BackoffPolicy, ConnectionEvent, ConnectionPhase, ConnectionState,
    ConnectionTransition,
};
pub use domain::reconciler::{Decision, Reconciler, ReconcilerStats};
pub use domain::subscription::{SubscriptionHandle, SubscriptionId, SubscriptionStats};
pub use domain::update::{
    AuthoritativeState, DataKind, KeyError, LogicalKey, Origin, SyncValue, ValueUpdate,
};

// Services and ports
pub use application::ports::{ErrorSink, FetchError, Fetcher, TracingErrorSink, UpdateSink};
pub use application::services::{
    EngineStats, EngineStopped, PollingScheduler, ScheduleError, SubscribeError, SyncEngine,
};

// Adapters
pub use infrastructure::config::{ConfigError, SyncConfig};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::http::{Endpoint, HttpFetcher, TimestampSource};
pub use infrastructure::push::{KeepaliveConfig, PushClient, PushClientConfig, PushError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
