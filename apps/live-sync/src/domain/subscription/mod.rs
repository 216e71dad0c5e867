//! Subscription Registry
//!
//! Tracks which consumers are interested in which keys and fans accepted
//! states out to them.
//!
//! # Design
//!
//! The registry itself is owned by the sync engine task and is not
//! synchronized. What crosses threads is each subscription's [`Gate`]: the
//! consumer's [`SubscriptionHandle`] and the registry entry share it, so
//! closing it from the consumer side takes effect before the engine gets
//! around to removing the entry.
//!
//! - Callbacks run in subscription order
//! - A closed gate is never invoked again, even mid-dispatch
//! - A panicking callback is logged and does not affect other subscribers

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::gate::Gate;
use super::update::{AuthoritativeState, LogicalKey};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier of a subscription.
pub type SubscriptionId = u64;

/// Consumer callback, invoked with each accepted state.
pub type Callback = Arc<dyn Fn(&AuthoritativeState) + Send + Sync>;

/// Consumer-side token for a subscription.
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    key: LogicalKey,
    gate: Arc<Gate>,
}

impl SubscriptionHandle {
    /// The subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The subscribed key.
    #[must_use]
    pub const fn key(&self) -> &LogicalKey {
        &self.key
    }

    /// Whether the subscription has not been cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Stop all future invocations of the callback.
    ///
    /// Waits for an invocation running on another thread to finish. Safe to
    /// call from inside the callback. Returns `false` if already cancelled.
    pub fn cancel(&self) -> bool {
        self.gate.close()
    }
}

/// Registry-side entry for a subscription.
pub struct Subscription {
    id: SubscriptionId,
    key: LogicalKey,
    callback: Callback,
    gate: Arc<Gate>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.gate.is_open())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Create a subscription and the handle that controls it.
    #[must_use]
    pub fn new(
        id: SubscriptionId,
        key: LogicalKey,
        callback: Callback,
    ) -> (Self, SubscriptionHandle) {
        let gate = Arc::new(Gate::new());
        let handle = SubscriptionHandle {
            id,
            key: key.clone(),
            gate: Arc::clone(&gate),
        };
        (
            Self {
                id,
                key,
                callback,
                gate,
            },
            handle,
        )
    }

    /// The subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The subscribed key.
    #[must_use]
    pub const fn key(&self) -> &LogicalKey {
        &self.key
    }

    /// Invoke the callback if still active. Returns whether it ran.
    fn notify(&self, state: &AuthoritativeState) -> bool {
        self.gate
            .run(|| {
                let result = catch_unwind(AssertUnwindSafe(|| (self.callback)(state)));
                if result.is_err() {
                    tracing::error!(
                        subscription_id = self.id,
                        key = %self.key,
                        "Subscriber callback panicked"
                    );
                }
            })
            .is_some()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// All live subscriptions, grouped by key in subscription order.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_key: HashMap<LogicalKey, Vec<Subscription>>,
    index: HashMap<SubscriptionId, LogicalKey>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and, if `current` is given, deliver it once.
    ///
    /// Returns whether the initial delivery ran.
    pub fn insert(
        &mut self,
        subscription: Subscription,
        current: Option<&AuthoritativeState>,
    ) -> bool {
        let delivered = current.is_some_and(|state| subscription.notify(state));

        tracing::debug!(
            subscription_id = subscription.id,
            key = %subscription.key,
            initial = delivered,
            "Subscription added"
        );

        self.index
            .insert(subscription.id, subscription.key.clone());
        self.by_key
            .entry(subscription.key.clone())
            .or_default()
            .push(subscription);

        delivered
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let Some(key) = self.index.remove(&id) else {
            return false;
        };

        if let Some(subscribers) = self.by_key.get_mut(&key) {
            if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
                let removed = subscribers.remove(pos);
                removed.gate.close();
            }
            if subscribers.is_empty() {
                self.by_key.remove(&key);
            }
        }

        tracing::debug!(subscription_id = id, key = %key, "Subscription removed");
        true
    }

    /// Invoke every active subscriber of the state's key, in subscription
    /// order. Returns the number of callbacks that ran.
    pub fn dispatch(&self, state: &AuthoritativeState) -> usize {
        self.by_key
            .get(state.update().key())
            .map_or(0, |subscribers| {
                subscribers.iter().filter(|s| s.notify(state)).count()
            })
    }

    /// Number of subscriptions for a key.
    #[must_use]
    pub fn subscriber_count(&self, key: &LogicalKey) -> usize {
        self.by_key.get(key).map_or(0, Vec::len)
    }

    /// Keys with at least one subscription, sorted.
    #[must_use]
    pub fn subscribed_keys(&self) -> Vec<LogicalKey> {
        let mut keys: Vec<_> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            key_count: self.by_key.len(),
            subscription_count: self.index.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of keys with subscribers.
    pub key_count: usize,
    /// Number of subscriptions.
    pub subscription_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
