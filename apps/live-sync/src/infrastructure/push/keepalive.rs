//! Keepalive Monitor
//!
//! Sends an application-level probe on a fixed cadence while the channel is
//! open and raises a timeout when nothing at all arrives within the timeout
//! window after a probe.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest probe cadence the monitor will run at.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Keepalive configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Time between probes.
    pub interval: Duration,
    /// How long after a probe the channel may stay silent.
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

impl KeepaliveConfig {
    /// Create a new configuration.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Send a probe now.
    SendProbe,
    /// Nothing arrived within the timeout after a probe.
    Timeout,
}

/// Liveness state shared between the monitor and the read loop.
#[derive(Debug)]
pub struct KeepaliveState {
    probe_sent_at: Mutex<Option<Instant>>,
    last_activity: Mutex<Instant>,
}

impl Default for KeepaliveState {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepaliveState {
    /// Create state for a fresh connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            probe_sent_at: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Record inbound traffic of any kind.
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
        *self.probe_sent_at.lock() = None;
    }

    /// Record that a probe went out. The earliest unanswered probe wins.
    pub fn mark_probe_sent(&self) {
        self.probe_sent_at.lock().get_or_insert_with(Instant::now);
    }

    /// Whether a probe is unanswered.
    #[must_use]
    pub fn is_probe_outstanding(&self) -> bool {
        self.probe_sent_at.lock().is_some()
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn deadline(&self, timeout: Duration) -> Option<Instant> {
        self.probe_sent_at.lock().map(|sent| sent + timeout)
    }
}

/// Drives probes and timeout detection for one connection.
pub struct KeepaliveMonitor {
    config: KeepaliveConfig,
    state: Arc<KeepaliveState>,
    event_tx: mpsc::Sender<KeepaliveEvent>,
    cancel: CancellationToken,
}

impl KeepaliveMonitor {
    /// Create a new monitor.
    #[must_use]
    pub const fn new(
        config: KeepaliveConfig,
        state: Arc<KeepaliveState>,
        event_tx: mpsc::Sender<KeepaliveEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or a timeout is detected.
    ///
    /// The first probe goes out one interval after start. A zero interval is
    /// raised to [`MIN_PROBE_INTERVAL`].
    pub async fn run(self) {
        let interval = self.config.interval.max(MIN_PROBE_INTERVAL);
        let mut probe = tokio::time::interval_at(Instant::now() + interval, interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.state.deadline(self.config.timeout);

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Keepalive monitor cancelled");
                    break;
                }
                _ = probe.tick() => {
                    self.state.mark_probe_sent();
                    if self.event_tx.send(KeepaliveEvent::SendProbe).await.is_err() {
                        break;
                    }
                }
                () = wait_until(deadline) => {
                    if self.state.deadline(self.config.timeout).is_some_and(|d| d <= Instant::now()) {
                        tracing::warn!(
                            idle_ms = u64::try_from(self.state.idle_for().as_millis()).unwrap_or(u64::MAX),
                            timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                            "Keepalive timeout"
                        );
                        let _ = self.event_tx.send(KeepaliveEvent::Timeout).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
