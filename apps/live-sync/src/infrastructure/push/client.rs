//! Push Channel Client
//!
//! Owns one WebSocket connection to the dashboard service and drives the
//! [`ConnectionState`] machine from transport outcomes.
//!
//! # Endpoint
//!
//! `{ws_base_url}/api/v1/ws`
//!
//! # Protocol
//!
//! Inbound frames are JSON text (see [`super::codec`]). The client sends the
//! literal text `ping` as an application keepalive; the service answers
//! `pong`. Any inbound frame counts as liveness.
//!
//! # Emission Guarantees
//!
//! State transitions and update submissions both pass through one [`Gate`].
//! `stop()` performs the `Closed` transition and closes the gate under the
//! same lock, so after it returns nothing more is emitted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{PushCodec, PushFrame};
use super::keepalive::{KeepaliveConfig, KeepaliveEvent, KeepaliveMonitor, KeepaliveState};
use crate::application::ports::UpdateSink;
use crate::domain::connection::{
    BackoffConfig, BackoffPolicy, ConnectionEvent, ConnectionPhase, ConnectionState,
    ConnectionTransition,
};
use crate::domain::gate::Gate;
use crate::domain::update::ValueUpdate;
use crate::infrastructure::metrics;

/// Text frame sent as a keepalive probe.
pub const KEEPALIVE_PROBE: &str = "ping";

const TRANSITION_CAPACITY: usize = 64;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end one connection attempt. All of them lead to a retry.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// WebSocket error (connect, read or write).
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The handshake did not complete in time.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The remote closed the connection.
    #[error("connection closed")]
    Closed,

    /// Nothing arrived within the keepalive timeout.
    #[error("keepalive timeout")]
    KeepaliveTimeout,
}

impl PushError {
    /// The state machine event this error maps to.
    #[must_use]
    pub const fn event(&self) -> ConnectionEvent {
        match self {
            Self::WebSocket(_) | Self::ConnectTimeout => ConnectionEvent::TransportError,
            Self::Closed => ConnectionEvent::TransportClosed,
            Self::KeepaliveTimeout => ConnectionEvent::KeepaliveTimeout,
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the push client.
#[derive(Debug, Clone)]
pub struct PushClientConfig {
    /// Full WebSocket URL.
    pub url: String,
    /// Keepalive configuration.
    pub keepalive: KeepaliveConfig,
    /// Reconnect backoff configuration.
    pub backoff: BackoffConfig,
    /// Handshake timeout.
    pub connect_timeout: Duration,
}

impl PushClientConfig {
    /// Create a configuration with default keepalive and backoff.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            keepalive: KeepaliveConfig::default(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the keepalive configuration.
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the backoff configuration.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

// =============================================================================
// Push Client
// =============================================================================

/// WebSocket client for the dashboard push channel.
///
/// Manages the connection lifecycle including:
/// - Keepalive probing and timeout detection
/// - Automatic reconnection with capped exponential backoff
/// - Decoding frames into push updates for the sink
pub struct PushClient {
    config: PushClientConfig,
    codec: PushCodec,
    backoff: BackoffPolicy,
    sink: Arc<dyn UpdateSink>,
    state: RwLock<ConnectionState>,
    gate: Gate,
    transitions: broadcast::Sender<ConnectionTransition>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PushClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushClient")
            .field("url", &self.config.url)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl PushClient {
    /// Create a client in the `Idle` phase.
    ///
    /// Cancelling `cancel` ends the connection loop; call [`Self::stop`] to
    /// also move the state machine to `Closed`.
    #[must_use]
    pub fn new(
        config: PushClientConfig,
        sink: Arc<dyn UpdateSink>,
        cancel: &CancellationToken,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            backoff: BackoffPolicy::new(config.backoff),
            config,
            codec: PushCodec::new(),
            sink,
            state: RwLock::new(ConnectionState::idle()),
            gate: Gate::new(),
            transitions,
            cancel: cancel.child_token(),
            task: Mutex::new(None),
        }
    }

    /// Start connecting.
    ///
    /// A no-op while `Connecting`, `Open` or `Backoff`. After [`Self::stop`]
    /// it logs a warning and does nothing. Returns whether this call started
    /// the connection loop.
    pub fn start(self: &Arc<Self>) -> bool {
        let Some(transition) = self.apply_event(ConnectionEvent::Start) else {
            tracing::warn!(url = %self.config.url, "start() called on a stopped push client");
            return false;
        };

        if transition.from.phase != ConnectionPhase::Idle {
            tracing::debug!(phase = transition.from.phase.as_str(), "Push client already started");
            return false;
        }

        let handle = tokio::spawn(Arc::clone(self).run());
        *self.task.lock() = Some(handle);
        true
    }

    /// Stop the client for good.
    ///
    /// Transitions to `Closed` and cancels any pending reconnect or
    /// keepalive timer. No update or transition is emitted after this
    /// returns. Idempotent; returns whether this call stopped it.
    pub fn stop(&self) -> bool {
        let stopped = self
            .gate
            .run(|| {
                let transition = self.transition(ConnectionEvent::Stop);
                self.gate.close();
                transition
            })
            .is_some();

        self.cancel.cancel();
        if stopped {
            tracing::info!(url = %self.config.url, "Push client stopped");
        }
        stopped
    }

    /// Stop and wait for the connection task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Snapshot of the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Receive every subsequent state transition.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionTransition> {
        self.transitions.subscribe()
    }

    /// Decode an inbound text frame.
    ///
    /// Returns the update it carries, if any. Malformed frames are logged and
    /// discarded.
    pub fn on_message(&self, raw: &str) -> Option<ValueUpdate> {
        match self.codec.decode(raw) {
            Ok(PushFrame::Update(update)) => Some(update),
            Ok(PushFrame::Connected { message }) => {
                tracing::info!(message = message.as_deref().unwrap_or(""), "Push channel greeting");
                None
            }
            Ok(PushFrame::Pong) => {
                tracing::trace!("Keepalive answered");
                None
            }
            Ok(PushFrame::Ignored { kind }) => {
                tracing::trace!(kind = %kind, "Ignoring push frame");
                None
            }
            Err(error) => {
                metrics::record_malformed_frame();
                tracing::warn!(error = %error, "Discarding malformed push frame");
                None
            }
        }
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Apply an event under the gate. `None` once stopped.
    fn apply_event(&self, event: ConnectionEvent) -> Option<ConnectionTransition> {
        self.gate.run(|| self.transition(event))
    }

    /// Apply an event. Caller must hold the gate.
    fn transition(&self, event: ConnectionEvent) -> ConnectionTransition {
        let now = Utc::now();
        let mut state = self.state.write();
        let from = *state;
        let to = from.on_event(event, now, &self.backoff);
        *state = to;
        drop(state);

        let transition = ConnectionTransition {
            from,
            to,
            event,
            at: now,
        };

        if from == to {
            tracing::trace!(phase = from.phase.as_str(), event = ?event, "Self-transition");
        } else {
            tracing::info!(
                from = from.phase.as_str(),
                to = to.phase.as_str(),
                event = ?event,
                attempt = to.attempt,
                "Push channel transition"
            );
            metrics::set_connection_phase(to.phase);
            let _ = self.transitions.send(transition);
        }

        transition
    }

    fn emit(&self, update: ValueUpdate) {
        let submitted = self.gate.run(|| self.sink.submit(update));
        if submitted == Some(false) {
            tracing::debug!("Update sink closed");
        }
    }

    // =========================================================================
    // Connection loop
    // =========================================================================

    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let Err(error) = self.connect_and_run().await else {
                break;
            };
            tracing::warn!(error = %error, url = %self.config.url, "Push connection error");

            let Some(failed) = self.apply_event(error.event()) else {
                break;
            };
            let delay = failed.to.retry_delay(Utc::now());
            metrics::record_reconnect();
            tracing::info!(
                attempt = failed.to.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting push channel"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            if self.apply_event(ConnectionEvent::RetryElapsed).is_none() {
                break;
            }
        }
        tracing::debug!(url = %self.config.url, "Push connection loop exited");
    }

    /// Connect and pump frames until an error or cancellation.
    ///
    /// `Ok(())` means the client was cancelled.
    async fn connect_and_run(&self) -> Result<(), PushError> {
        tracing::info!(url = %self.config.url, "Connecting to push channel");

        let connected = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(self.config.url.as_str()),
            ) => result,
        };
        let (ws_stream, _response) = connected.map_err(|_| PushError::ConnectTimeout)??;

        if self.apply_event(ConnectionEvent::HandshakeSucceeded).is_none() {
            return Ok(());
        }

        let (mut write, mut read) = ws_stream.split();

        let liveness = Arc::new(KeepaliveState::new());
        let (keepalive_tx, mut keepalive_rx) = mpsc::channel(4);
        let keepalive_cancel = self.cancel.child_token();
        let _keepalive_guard = keepalive_cancel.clone().drop_guard();
        tokio::spawn(
            KeepaliveMonitor::new(
                self.config.keepalive,
                Arc::clone(&liveness),
                keepalive_tx,
                keepalive_cancel,
            )
            .run(),
        );

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                event = keepalive_rx.recv() => {
                    match event {
                        Some(KeepaliveEvent::SendProbe) => {
                            write.send(Message::Text(KEEPALIVE_PROBE.into())).await?;
                        }
                        Some(KeepaliveEvent::Timeout) => return Err(PushError::KeepaliveTimeout),
                        None => return Err(PushError::Closed),
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("Push stream ended");
                            return Err(PushError::Closed);
                        }
                    };

                    liveness.record_activity();
                    let _ = self.apply_event(ConnectionEvent::MessageReceived);

                    match msg {
                        Message::Text(text) => {
                            if let Some(update) = self.on_message(text.as_str()) {
                                self.emit(update);
                            }
                        }
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Message::Close(_) => {
                            tracing::info!("Server sent close frame");
                            return Err(PushError::Closed);
                        }
                        Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }
}
