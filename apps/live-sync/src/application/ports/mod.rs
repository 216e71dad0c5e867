//! Port Interfaces
//!
//! Contracts between the sync services and the outside world.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Fetcher`]: one pull request producing a polled update
//! - [`ErrorSink`]: where failed polls are reported
//!
//! ## Driver Ports (Inbound)
//!
//! - [`UpdateSink`]: where producers submit raw updates

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::update::{LogicalKey, ValueUpdate};

// =============================================================================
// Update Sink
// =============================================================================

/// Destination for raw updates from producers.
pub trait UpdateSink: Send + Sync {
    /// Submit an update. Returns `false` if the receiver is gone.
    fn submit(&self, update: ValueUpdate) -> bool;
}

impl UpdateSink for mpsc::UnboundedSender<ValueUpdate> {
    fn submit(&self, update: ValueUpdate) -> bool {
        self.send(update).is_ok()
    }
}

// =============================================================================
// Fetcher
// =============================================================================

/// Errors from a single pull request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The request did not complete.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// The response body could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The service has no value for this key yet.
    #[error("no data available")]
    NoData,
}

impl FetchError {
    /// Label used in metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Status { .. } => "status",
            Self::Malformed(_) => "malformed",
            Self::NoData => "no_data",
        }
    }
}

/// One pull request for one key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. The returned update must have `Origin::Poll`.
    async fn fetch(&self) -> Result<ValueUpdate, FetchError>;
}

// =============================================================================
// Error Sink
// =============================================================================

/// Receiver of per-tick poll failures.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorSink: Send + Sync {
    /// Report a failed tick for `key`.
    fn report(&self, key: &LogicalKey, error: &FetchError);
}

/// [`ErrorSink`] that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, key: &LogicalKey, error: &FetchError) {
        match error {
            FetchError::NoData => tracing::debug!(key = %key, "Poll returned no data"),
            _ => tracing::warn!(key = %key, error = %error, "Poll failed"),
        }
    }
}
