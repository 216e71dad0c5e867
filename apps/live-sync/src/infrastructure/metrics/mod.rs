//! Prometheus Metrics Module
//!
//! # Metrics Categories
//!
//! - **Updates**: reconciler decisions by origin
//! - **Polling**: failures by kind, skipped ticks, request latency
//! - **Push channel**: malformed frames, reconnects, current phase
//! - **Subscriptions**: active subscription count
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder, so
//! library code records unconditionally. Metrics are exposed at `/metrics`
//! on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionPhase;
use crate::domain::reconciler::Decision;
use crate::domain::update::Origin;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the existing handle.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "live_sync_updates_total",
        "Updates processed by the reconciler, by origin and decision"
    );

    describe_counter!(
        "live_sync_poll_failures_total",
        "Failed poll ticks by error kind"
    );
    describe_counter!(
        "live_sync_poll_ticks_skipped_total",
        "Poll ticks skipped because a request was still in flight"
    );
    describe_histogram!(
        "live_sync_poll_duration_seconds",
        "Duration of pull requests"
    );

    describe_counter!(
        "live_sync_malformed_frames_total",
        "Push frames discarded as malformed"
    );
    describe_counter!(
        "live_sync_reconnects_total",
        "Push channel reconnection attempts"
    );
    describe_gauge!(
        "live_sync_connection_phase",
        "1 for the current push channel phase, 0 otherwise"
    );

    describe_gauge!(
        "live_sync_subscriptions",
        "Number of active subscriptions"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const PHASES: [ConnectionPhase; 5] = [
    ConnectionPhase::Idle,
    ConnectionPhase::Connecting,
    ConnectionPhase::Open,
    ConnectionPhase::Backoff,
    ConnectionPhase::Closed,
];

/// Record a reconciler decision.
pub fn record_update(origin: Origin, decision: Decision) {
    counter!(
        "live_sync_updates_total",
        "origin" => origin.as_str(),
        "decision" => decision.as_str()
    )
    .increment(1);
}

/// Record a failed poll tick.
pub fn record_poll_failure(kind: &'static str) {
    counter!("live_sync_poll_failures_total", "kind" => kind).increment(1);
}

/// Record a poll tick skipped due to an outstanding request.
pub fn record_poll_skipped() {
    counter!("live_sync_poll_ticks_skipped_total").increment(1);
}

/// Record the duration of a pull request.
pub fn record_poll_duration(duration: Duration) {
    histogram!("live_sync_poll_duration_seconds").record(duration.as_secs_f64());
}

/// Record a malformed push frame.
pub fn record_malformed_frame() {
    counter!("live_sync_malformed_frames_total").increment(1);
}

/// Record a push channel reconnection attempt.
pub fn record_reconnect() {
    counter!("live_sync_reconnects_total").increment(1);
}

/// Mark `current` as the active connection phase.
pub fn set_connection_phase(current: ConnectionPhase) {
    for phase in PHASES {
        let value = if phase == current { 1.0 } else { 0.0 };
        gauge!("live_sync_connection_phase", "phase" => phase.as_str()).set(value);
    }
}

/// Update the subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("live_sync_subscriptions").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
