//! Polling Scheduler
//!
//! Named, independently cadenced pull tasks, one per key.
//!
//! - The first tick fires immediately, then every `interval`
//! - At most one request per key is in flight; a tick that fires while one is
//!   outstanding is skipped, not queued
//! - A failed tick is reported to the [`ErrorSink`] and never cancels the task
//! - `unschedule` stops future ticks; a request already in flight runs to
//!   completion but its result is discarded
//! - A panicking fetch releases the in-flight slot, so the next tick runs

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ErrorSink, FetchError, Fetcher, UpdateSink};
use crate::domain::gate::Gate;
use crate::domain::update::{KeyError, LogicalKey, Origin, ValueUpdate};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by [`PollingScheduler::schedule`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// A task is already scheduled for this key.
    #[error("key already scheduled: {0}")]
    Duplicate(LogicalKey),

    /// The interval was zero.
    #[error("poll interval must be greater than zero")]
    ZeroInterval,

    /// The key was invalid.
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
}

// =============================================================================
// Scheduler
// =============================================================================

struct PollTask {
    interval: Duration,
    gate: Arc<Gate>,
    cancel: CancellationToken,
}

impl PollTask {
    fn stop(&self) {
        self.gate.close();
        self.cancel.cancel();
    }
}

/// Shared by every spawned piece of one poll task.
struct PollContext {
    key: LogicalKey,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn UpdateSink>,
    errors: Arc<dyn ErrorSink>,
    gate: Arc<Gate>,
    in_flight: AtomicBool,
}

/// Owner of all recurring pull tasks.
pub struct PollingScheduler {
    sink: Arc<dyn UpdateSink>,
    errors: Arc<dyn ErrorSink>,
    tasks: Mutex<HashMap<LogicalKey, PollTask>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("scheduled", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl PollingScheduler {
    /// Create a scheduler delivering into `sink`.
    ///
    /// Every task stops when `cancel` fires.
    #[must_use]
    pub fn new(
        sink: Arc<dyn UpdateSink>,
        errors: Arc<dyn ErrorSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            errors,
            tasks: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Start polling `key` every `interval` with `fetcher`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] for an empty key, a zero interval, or a key
    /// that is already scheduled.
    pub fn schedule(
        &self,
        key: impl AsRef<str>,
        interval: Duration,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(), ScheduleError> {
        let key = LogicalKey::new(key.as_ref())?;
        if interval.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&key) {
            return Err(ScheduleError::Duplicate(key));
        }

        let gate = Arc::new(Gate::new());
        let cancel = self.cancel.child_token();
        let ctx = Arc::new(PollContext {
            key: key.clone(),
            fetcher,
            sink: Arc::clone(&self.sink),
            errors: Arc::clone(&self.errors),
            gate: Arc::clone(&gate),
            in_flight: AtomicBool::new(false),
        });

        tokio::spawn(run_poll_loop(ctx, interval, cancel.clone()));

        tracing::info!(
            key = %key,
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Poll task scheduled"
        );
        tasks.insert(
            key,
            PollTask {
                interval,
                gate,
                cancel,
            },
        );
        Ok(())
    }

    /// Stop polling `key`. Returns `false` if it was not scheduled.
    ///
    /// After this returns, nothing attributable to the task reaches the
    /// update sink or the error sink.
    pub fn unschedule(&self, key: &LogicalKey) -> bool {
        let Some(task) = self.tasks.lock().remove(key) else {
            return false;
        };
        task.stop();
        tracing::info!(key = %key, "Poll task unscheduled");
        true
    }

    /// Whether `key` has a poll task.
    #[must_use]
    pub fn is_scheduled(&self, key: &LogicalKey) -> bool {
        self.tasks.lock().contains_key(key)
    }

    /// Scheduled keys with their intervals, sorted by key.
    #[must_use]
    pub fn scheduled_keys(&self) -> Vec<(LogicalKey, Duration)> {
        let mut keys: Vec<_> = self
            .tasks
            .lock()
            .iter()
            .map(|(key, task)| (key.clone(), task.interval))
            .collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        keys
    }

    /// Unschedule every task.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (_, task) in &tasks {
            task.stop();
        }
        if !tasks.is_empty() {
            tracing::info!(count = tasks.len(), "Poll tasks stopped");
        }
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().values() {
            task.stop();
        }
    }
}

// =============================================================================
// Poll Loop
// =============================================================================

async fn run_poll_loop(ctx: Arc<PollContext>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(key = %ctx.key, "Poll loop cancelled");
                break;
            }
            _ = ticker.tick() => {}
        }

        if ctx.in_flight.swap(true, Ordering::AcqRel) {
            metrics::record_poll_skipped();
            tracing::debug!(key = %ctx.key, "Previous request still in flight, skipping tick");
            continue;
        }

        tokio::spawn(poll_once(Arc::clone(&ctx)));
    }
}

/// Clears the in-flight flag when dropped, including on unwind.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn poll_once(ctx: Arc<PollContext>) {
    let _in_flight = InFlight(&ctx.in_flight);
    let started = Instant::now();
    let result = ctx.fetcher.fetch().await;
    metrics::record_poll_duration(started.elapsed());

    let delivered = ctx.gate.run(|| deliver(&ctx, result));
    if delivered.is_none() {
        tracing::debug!(key = %ctx.key, "Discarded result of unscheduled poll task");
    }
}

fn deliver(ctx: &PollContext, result: Result<ValueUpdate, FetchError>) {
    let outcome = result.and_then(|update| {
        if update.key() != &ctx.key {
            return Err(FetchError::Malformed(format!(
                "fetcher returned key {} for task {}",
                update.key(),
                ctx.key
            )));
        }
        if update.origin() != Origin::Poll {
            return Err(FetchError::Malformed("fetcher returned a push update".into()));
        }
        Ok(update)
    });

    match outcome {
        Ok(update) => {
            if !ctx.sink.submit(update) {
                tracing::debug!(key = %ctx.key, "Update sink closed");
            }
        }
        Err(error) => {
            metrics::record_poll_failure(error.kind());
            ctx.errors.report(&ctx.key, &error);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
