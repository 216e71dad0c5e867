//! Sync Engine
//!
//! The single serialized event loop that owns the [`Reconciler`] and the
//! [`SubscriptionRegistry`]. Producers and consumers talk to it through a
//! FIFO command queue, so reconciliation has exactly one writer and updates
//! are applied in dequeue order.
//!
//! Subscriber callbacks run synchronously on the engine task in the same
//! loop turn that accepted the update. They must not block.
//!
//! [`SyncEngine::unsubscribe`] is synchronous. When called from async code
//! while that subscription's callback is running, it blocks the calling
//! worker thread until the callback returns. Slow callbacks therefore stall
//! unsubscribers as well as the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::UpdateSink;
use crate::domain::reconciler::{Reconciler, ReconcilerStats};
use crate::domain::subscription::{
    Callback, Subscription, SubscriptionHandle, SubscriptionId, SubscriptionRegistry,
    SubscriptionStats,
};
use crate::domain::update::{AuthoritativeState, KeyError, LogicalKey, ValueUpdate};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// The engine task is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sync engine stopped")]
pub struct EngineStopped;

/// Errors returned by [`SyncEngine::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The key was invalid.
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    /// The engine task is no longer running.
    #[error(transparent)]
    Stopped(#[from] EngineStopped),
}

// =============================================================================
// Commands
// =============================================================================

enum Command {
    Apply(ValueUpdate),
    Subscribe(Subscription),
    Unsubscribe(SubscriptionId),
    Current(LogicalKey, oneshot::Sender<Option<AuthoritativeState>>),
    Snapshot(oneshot::Sender<Vec<AuthoritativeState>>),
    Stats(oneshot::Sender<EngineStats>),
    Flush(oneshot::Sender<()>),
}

/// Combined reconciler and registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Reconciler decision counters.
    pub reconciler: ReconcilerStats,
    /// Registry counters.
    pub subscriptions: SubscriptionStats,
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Cloneable handle to the engine task.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Apply(_) => "Apply",
            Self::Subscribe(_) => "Subscribe",
            Self::Unsubscribe(_) => "Unsubscribe",
            Self::Current(..) => "Current",
            Self::Snapshot(_) => "Snapshot",
            Self::Stats(_) => "Stats",
            Self::Flush(_) => "Flush",
        };
        f.write_str(name)
    }
}

impl SyncEngine {
    /// Spawn the engine task.
    ///
    /// The task ends when `cancel` fires or every handle is dropped.
    #[must_use]
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, cancel));
        (
            Self {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            task,
        )
    }

    /// Register `callback` for `key`.
    ///
    /// If the key already has an authoritative state, the callback is
    /// invoked once with it on the engine task before any later update.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError::InvalidKey`] for an empty key and
    /// [`SubscribeError::Stopped`] if the engine is gone.
    pub fn subscribe<F>(
        &self,
        key: impl AsRef<str>,
        callback: F,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        F: Fn(&AuthoritativeState) + Send + Sync + 'static,
    {
        let key = LogicalKey::new(key.as_ref())?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(callback);
        let (subscription, handle) = Subscription::new(id, key, callback);

        self.tx
            .send(Command::Subscribe(subscription))
            .map_err(|_| EngineStopped)?;
        Ok(handle)
    }

    /// Remove a subscription.
    ///
    /// No invocation of its callback starts after this returns. If one is
    /// running on the engine task, this blocks the current thread until it
    /// returns. Idempotent; returns `false` if the subscription was already
    /// cancelled.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let cancelled = handle.cancel();
        let _ = self.tx.send(Command::Unsubscribe(handle.id()));
        cancelled
    }

    /// Current authoritative state for a key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine is gone.
    pub async fn current(&self, key: &LogicalKey) -> Result<Option<AuthoritativeState>, EngineStopped> {
        self.request(|reply| Command::Current(key.clone(), reply)).await
    }

    /// Every authoritative state, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine is gone.
    pub async fn snapshot(&self) -> Result<Vec<AuthoritativeState>, EngineStopped> {
        self.request(Command::Snapshot).await
    }

    /// Engine statistics.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine is gone.
    pub async fn stats(&self) -> Result<EngineStats, EngineStopped> {
        self.request(Command::Stats).await
    }

    /// Wait until every command queued before this call has been processed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine is gone.
    pub async fn flush(&self) -> Result<(), EngineStopped> {
        self.request(Command::Flush).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineStopped> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).map_err(|_| EngineStopped)?;
        reply_rx.await.map_err(|_| EngineStopped)
    }
}

impl UpdateSink for SyncEngine {
    fn submit(&self, update: ValueUpdate) -> bool {
        self.tx.send(Command::Apply(update)).is_ok()
    }
}

// =============================================================================
// Engine Task
// =============================================================================

#[derive(Default)]
struct EngineState {
    reconciler: Reconciler,
    registry: SubscriptionRegistry,
}

impl EngineState {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Apply(update) => self.apply(update),
            Command::Subscribe(subscription) => {
                let key = subscription.key().clone();
                self.registry
                    .insert(subscription, self.reconciler.get(&key));
                metrics::set_subscriptions(self.registry.stats().subscription_count);
            }
            Command::Unsubscribe(id) => {
                if self.registry.remove(id) {
                    metrics::set_subscriptions(self.registry.stats().subscription_count);
                }
            }
            Command::Current(key, reply) => {
                let _ = reply.send(self.reconciler.get(&key).cloned());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.reconciler.snapshot());
            }
            Command::Stats(reply) => {
                let _ = reply.send(EngineStats {
                    reconciler: self.reconciler.stats(),
                    subscriptions: self.registry.stats(),
                });
            }
            Command::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn apply(&mut self, update: ValueUpdate) {
        let key = update.key().clone();
        let origin = update.origin();
        let decision = self.reconciler.apply(update, Utc::now());
        metrics::record_update(origin, decision);

        if !decision.is_accepted() {
            return;
        }

        if let Some(state) = self.reconciler.get(&key) {
            let notified = self.registry.dispatch(state);
            tracing::trace!(
                key = %key,
                origin = origin.as_str(),
                subscribers = notified,
                "Accepted update"
            );
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
    let mut state = EngineState::default();
    tracing::debug!("Sync engine started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("Sync engine cancelled");
                break;
            }
            command = rx.recv() => {
                let Some(command) = command else {
                    tracing::debug!("All engine handles dropped");
                    break;
                };
                state.handle(command);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::update::SyncValue;

    fn key(raw: &str) -> LogicalKey {
        LogicalKey::new(raw).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn price(raw: &str, value: i64, secs: i64) -> ValueUpdate {
        ValueUpdate::poll(key(raw), SyncValue::Number(Decimal::from(value)), at(secs))
    }

    fn recorder() -> (Arc<Mutex<Vec<Decimal>>>, impl Fn(&AuthoritativeState) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |s: &AuthoritativeState| {
            sink.lock().push(s.value().as_number().unwrap());
        })
    }

    #[tokio::test]
    async fn accepted_updates_reach_subscribers_in_order() {
        let (engine, _task) = SyncEngine::spawn(CancellationToken::new());
        let (seen, callback) = recorder();
        engine.subscribe("USD/LYD", callback).unwrap();

        for (value, secs) in [(10, 10), (30, 30), (20, 20), (40, 40)] {
            assert!(engine.submit(price("USD/LYD", value, secs)));
        }
        engine.flush().await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![Decimal::from(10), Decimal::from(30), Decimal::from(40)]
        );
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.reconciler.accepted, 3);
        assert_eq!(stats.reconciler.stale, 1);
    }

    #[tokio::test]
    async fn late_subscriber_gets_current_state_first() {
        let (engine, _task) = SyncEngine::spawn(CancellationToken::new());
        engine.submit(price("USD/LYD", 7, 1));

        let (seen, callback) = recorder();
        engine.subscribe("USD/LYD", callback).unwrap();
        engine.submit(price("USD/LYD", 8, 2));
        engine.flush().await.unwrap();

        assert_eq!(*seen.lock(), vec![Decimal::from(7), Decimal::from(8)]);
    }

    #[tokio::test]
    async fn unsubscribe_isolates_other_subscribers() {
        let (engine, _task) = SyncEngine::spawn(CancellationToken::new());
        let (seen_a, a) = recorder();
        let (seen_b, b) = recorder();
        let handle_a = engine.subscribe("USD/LYD", a).unwrap();
        engine.subscribe("USD/LYD", b).unwrap();

        engine.submit(price("USD/LYD", 1, 1));
        engine.flush().await.unwrap();
        assert!(engine.unsubscribe(&handle_a));
        assert!(!engine.unsubscribe(&handle_a));
        engine.submit(price("USD/LYD", 2, 2));
        engine.flush().await.unwrap();

        assert_eq!(*seen_a.lock(), vec![Decimal::from(1)]);
        assert_eq!(*seen_b.lock(), vec![Decimal::from(1), Decimal::from(2)]);
        assert_eq!(
            engine.current(&key("USD/LYD")).await.unwrap().unwrap().value().as_number(),
            Some(Decimal::from(2))
        );
        assert_eq!(engine.stats().await.unwrap().subscriptions.subscription_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribe_blocks_until_running_callback_returns() {
        let (engine, _task) = SyncEngine::spawn(CancellationToken::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicU64::new(0));
        let done = Arc::clone(&finished);
        let handle = engine
            .subscribe("USD/LYD", move |_: &AuthoritativeState| {
                let _ = started_tx.send(());
                std::thread::sleep(std::time::Duration::from_millis(200));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        engine.submit(price("USD/LYD", 1, 1));
        tokio::time::timeout(std::time::Duration::from_secs(2), started_rx.recv())
            .await
            .expect("callback should start")
            .unwrap();

        let started = std::time::Instant::now();
        assert!(engine.unsubscribe(&handle));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let (engine, _task) = SyncEngine::spawn(CancellationToken::new());
        let err = engine.subscribe("  ", |_: &AuthoritativeState| {}).unwrap_err();
        assert_eq!(err, SubscribeError::InvalidKey(KeyError::Empty));
    }

    #[tokio::test]
    async fn cancelled_engine_reports_stopped() {
        let cancel = CancellationToken::new();
        let (engine, task) = SyncEngine::spawn(cancel.clone());
        cancel.cancel();
        task.await.unwrap();

        assert!(!engine.submit(price("USD/LYD", 1, 1)));
        assert_eq!(engine.flush().await, Err(EngineStopped));
        assert!(matches!(
            engine.subscribe("USD/LYD", |_: &AuthoritativeState| {}),
            Err(SubscribeError::Stopped(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_key() {
        let (engine, _task) = SyncEngine::spawn(CancellationToken::new());
        engine.submit(price("USD/LYD", 1, 1));
        engine.submit(price("EUR/LYD", 2, 1));

        let keys: Vec<_> = engine
            .snapshot()
            .await
            .unwrap()
            .iter()
            .map(|s| s.update().key().to_string())
            .collect();
        assert_eq!(keys, ["EUR/LYD", "USD/LYD"]);
    }
}
