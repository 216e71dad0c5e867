//! Connection State Machine
//!
//! Lifecycle of one persistent push channel as an explicit enum plus a total
//! transition table. Every `(phase, event)` pair maps to exactly one next
//! state; pairs with nothing to do are explicit self-transitions.
//!
//! ```text
//!            Start            HandshakeSucceeded
//!   Idle ───────────► Connecting ───────────────► Open
//!                        ▲   │                     │
//!           RetryElapsed │   │ error / close /     │ error / close /
//!                        │   ▼ keepalive timeout   │ keepalive timeout
//!                      Backoff ◄───────────────────┘
//!
//!   any ── Stop ──► Closed (terminal)
//! ```

mod backoff;

pub use backoff::{BackoffConfig, BackoffPolicy};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle phase of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    /// Not started yet.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Connected and receiving.
    Open,
    /// Waiting before the next connect attempt.
    Backoff,
    /// Stopped. Terminal.
    Closed,
}

impl ConnectionPhase {
    /// Label used in logs, metrics and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Backoff => "backoff",
            Self::Closed => "closed",
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// `start()` was called.
    Start,
    /// The transport handshake completed.
    HandshakeSucceeded,
    /// Any inbound traffic.
    MessageReceived,
    /// Transport failure (connect refused, read/write error).
    TransportError,
    /// Remote closed the connection.
    TransportClosed,
    /// No traffic within the keepalive timeout after a probe.
    KeepaliveTimeout,
    /// The backoff delay elapsed.
    RetryElapsed,
    /// `stop()` was called.
    Stop,
}

/// State of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Consecutive failed attempts since the last successful handshake.
    pub attempt: u32,
    /// When the next reconnect is due (only set in `Backoff`).
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::idle()
    }
}

impl ConnectionState {
    /// Initial state.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            attempt: 0,
            next_retry_at: None,
        }
    }

    /// Apply an event and return the next state.
    #[must_use]
    pub fn on_event(
        &self,
        event: ConnectionEvent,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> Self {
        use ConnectionEvent as E;
        use ConnectionPhase as P;

        match (self.phase, event) {
            (P::Closed, _) => *self,
            (_, E::Stop) => Self {
                phase: P::Closed,
                attempt: self.attempt,
                next_retry_at: None,
            },

            (P::Idle, E::Start) => self.with_phase(P::Connecting),
            (
                P::Idle,
                E::HandshakeSucceeded
                | E::MessageReceived
                | E::TransportError
                | E::TransportClosed
                | E::KeepaliveTimeout
                | E::RetryElapsed,
            ) => *self,

            (P::Connecting, E::HandshakeSucceeded) => Self {
                phase: P::Open,
                attempt: 0,
                next_retry_at: None,
            },
            (P::Connecting | P::Open, E::TransportError | E::TransportClosed | E::KeepaliveTimeout) => {
                self.fail(now, backoff)
            }
            (P::Connecting, E::Start | E::MessageReceived | E::RetryElapsed) => *self,

            (P::Open, E::Start | E::HandshakeSucceeded | E::MessageReceived | E::RetryElapsed) => {
                *self
            }

            (P::Backoff, E::RetryElapsed) => self.with_phase(P::Connecting),
            (
                P::Backoff,
                E::Start
                | E::HandshakeSucceeded
                | E::MessageReceived
                | E::TransportError
                | E::TransportClosed
                | E::KeepaliveTimeout,
            ) => *self,
        }
    }

    /// Whether the channel is currently open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Open)
    }

    /// Whether the channel is started and not stopped.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Open | ConnectionPhase::Backoff
        )
    }

    /// Time left until `next_retry_at`, zero if due or unset.
    #[must_use]
    pub fn retry_delay(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.next_retry_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or_default()
    }

    const fn with_phase(self, phase: ConnectionPhase) -> Self {
        Self {
            phase,
            attempt: self.attempt,
            next_retry_at: None,
        }
    }

    fn fail(self, now: DateTime<Utc>, backoff: &BackoffPolicy) -> Self {
        let attempt = self.attempt.saturating_add(1);
        let delay = backoff.delay(attempt);
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        Self {
            phase: ConnectionPhase::Backoff,
            attempt,
            next_retry_at,
        }
    }
}

/// A state change, broadcast for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionTransition {
    /// State before the event.
    pub from: ConnectionState,
    /// State after the event.
    pub to: ConnectionState,
    /// The event that caused it.
    pub event: ConnectionEvent,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}
