//! Push/Poll Reconciliation
//!
//! Merges updates from both producers into one authoritative value per key.
//!
//! # Rules
//!
//! - No prior state: accept.
//! - `observed_at` strictly newer than `last_accepted_at`: accept.
//! - Equal `observed_at`: a push update replaces a polled one. Every other
//!   tie is a duplicate.
//! - Older: stale.
//!
//! Rejections are not errors. They are traced and counted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::update::{AuthoritativeState, LogicalKey, Origin, ValueUpdate};

/// Outcome of applying an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// The update replaced the authoritative state.
    Accepted,
    /// The update was older than the authoritative state.
    Stale,
    /// The update had the same `observed_at` and did not win the tie.
    Duplicate,
}

impl Decision {
    /// Whether subscribers should be notified.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Stale => "stale",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Counters of decisions made so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    /// Number of tracked keys.
    pub keys: usize,
    /// Accepted updates.
    pub accepted: u64,
    /// Updates rejected as older.
    pub stale: u64,
    /// Updates rejected as ties.
    pub duplicate: u64,
}

/// Owner of the authoritative state for every key.
///
/// Not synchronized: exactly one task (the sync engine) mutates it.
///
/// # Example
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use live_sync::domain::reconciler::{Decision, Reconciler};
/// use live_sync::domain::update::{LogicalKey, SyncValue, ValueUpdate};
/// use rust_decimal::Decimal;
///
/// let key = LogicalKey::new("USD/LYD").unwrap();
/// let t = |s| Utc.timestamp_opt(s, 0).unwrap();
/// let mut reconciler = Reconciler::new();
///
/// let newer = ValueUpdate::poll(key.clone(), SyncValue::Number(Decimal::from(5)), t(20));
/// let older = ValueUpdate::push(key.clone(), SyncValue::Number(Decimal::from(4)), t(10));
///
/// assert_eq!(reconciler.apply(newer, t(21)), Decision::Accepted);
/// assert_eq!(reconciler.apply(older, t(22)), Decision::Stale);
/// assert_eq!(reconciler.get(&key).unwrap().value().as_number(), Some(Decimal::from(5)));
/// ```
#[derive(Debug, Default)]
pub struct Reconciler {
    states: HashMap<LogicalKey, AuthoritativeState>,
    accepted: u64,
    stale: u64,
    duplicate: u64,
}

impl Reconciler {
    /// Create an empty reconciler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update received locally at `received_at`.
    pub fn apply(&mut self, update: ValueUpdate, received_at: DateTime<Utc>) -> Decision {
        let decision = self
            .states
            .get(update.key())
            .map_or(Decision::Accepted, |current| decide(current.update(), &update));

        match decision {
            Decision::Accepted => {
                self.accepted += 1;
                self.states.insert(
                    update.key().clone(),
                    AuthoritativeState::new(update, received_at),
                );
            }
            Decision::Stale => {
                self.stale += 1;
                tracing::trace!(
                    key = %update.key(),
                    origin = update.origin().as_str(),
                    observed_at = %update.observed_at(),
                    "Rejected stale update"
                );
            }
            Decision::Duplicate => {
                self.duplicate += 1;
                tracing::trace!(
                    key = %update.key(),
                    origin = update.origin().as_str(),
                    observed_at = %update.observed_at(),
                    "Rejected duplicate update"
                );
            }
        }

        decision
    }

    /// Current authoritative state for a key.
    #[must_use]
    pub fn get(&self, key: &LogicalKey) -> Option<&AuthoritativeState> {
        self.states.get(key)
    }

    /// Clones of every authoritative state, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AuthoritativeState> {
        let mut states: Vec<_> = self.states.values().cloned().collect();
        states.sort_by(|a, b| a.update().key().cmp(b.update().key()));
        states
    }

    /// Tracked keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<LogicalKey> {
        let mut keys: Vec<_> = self.states.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no key has been accepted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Decision counters.
    #[must_use]
    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            keys: self.states.len(),
            accepted: self.accepted,
            stale: self.stale,
            duplicate: self.duplicate,
        }
    }
}

fn decide(current: &ValueUpdate, incoming: &ValueUpdate) -> Decision {
    match incoming.observed_at().cmp(&current.observed_at()) {
        std::cmp::Ordering::Greater => Decision::Accepted,
        std::cmp::Ordering::Less => Decision::Stale,
        std::cmp::Ordering::Equal => match (current.origin(), incoming.origin()) {
            (Origin::Poll, Origin::Push) => Decision::Accepted,
            _ => Decision::Duplicate,
        },
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::update::SyncValue;

    fn key() -> LogicalKey {
        LogicalKey::new("USD/LYD").unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn update(origin: Origin, value: i64, secs: i64) -> ValueUpdate {
        ValueUpdate::new(key(), SyncValue::Number(Decimal::from(value)), at(secs), origin)
    }

    fn current_value(r: &Reconciler) -> Option<Decimal> {
        r.get(&key()).and_then(|s| s.value().as_number())
    }

    #[test]
    fn first_update_is_accepted() {
        let mut r = Reconciler::new();
        assert_eq!(r.apply(update(Origin::Poll, 1, 0), at(1)), Decision::Accepted);
        assert_eq!(r.len(), 1);
        assert_eq!(r.get(&key()).unwrap().received_at(), at(1));
    }

    #[test]
    fn out_of_order_updates_never_regress() {
        let mut r = Reconciler::new();
        let mut delivered = Vec::new();

        for (value, secs) in [(10, 10), (30, 30), (20, 20), (40, 40)] {
            if r.apply(update(Origin::Poll, value, secs), at(100)).is_accepted() {
                delivered.push(value);
            }
        }

        assert_eq!(delivered, vec![10, 30, 40]);
        assert_eq!(current_value(&r), Some(Decimal::from(40)));
        assert_eq!(r.stats().stale, 1);
    }

    #[test]
    fn push_wins_tie_when_arriving_second() {
        let mut r = Reconciler::new();
        r.apply(update(Origin::Poll, 1, 5), at(6));
        assert_eq!(r.apply(update(Origin::Push, 2, 5), at(7)), Decision::Accepted);
        assert_eq!(current_value(&r), Some(Decimal::from(2)));
    }

    #[test]
    fn push_wins_tie_when_arriving_first() {
        let mut r = Reconciler::new();
        r.apply(update(Origin::Push, 2, 5), at(6));
        assert_eq!(r.apply(update(Origin::Poll, 1, 5), at(7)), Decision::Duplicate);
        assert_eq!(current_value(&r), Some(Decimal::from(2)));
    }

    #[test]
    fn same_origin_tie_is_duplicate() {
        let mut r = Reconciler::new();
        r.apply(update(Origin::Push, 1, 5), at(6));
        assert_eq!(r.apply(update(Origin::Push, 9, 5), at(7)), Decision::Duplicate);

        r.apply(update(Origin::Poll, 3, 8), at(9));
        assert_eq!(r.apply(update(Origin::Poll, 4, 8), at(10)), Decision::Duplicate);
        assert_eq!(current_value(&r), Some(Decimal::from(3)));
        assert_eq!(r.stats().duplicate, 2);
    }

    #[test]
    fn keys_are_independent() {
        let mut r = Reconciler::new();
        let eur = LogicalKey::new("EUR/LYD").unwrap();

        r.apply(update(Origin::Poll, 1, 50), at(51));
        let older_other_key =
            ValueUpdate::poll(eur.clone(), SyncValue::Number(Decimal::ONE), at(10));
        assert_eq!(r.apply(older_other_key, at(52)), Decision::Accepted);
        assert_eq!(r.keys(), vec![eur, key()]);
        assert_eq!(r.snapshot().len(), 2);
    }

    fn origin_strategy() -> impl Strategy<Value = Origin> {
        prop_oneof![Just(Origin::Push), Just(Origin::Poll)]
    }

    proptest! {
        #[test]
        fn last_accepted_at_never_decreases(
            updates in prop::collection::vec((origin_strategy(), 0i64..50), 1..64)
        ) {
            let mut r = Reconciler::new();
            let mut high_water: Option<DateTime<Utc>> = None;

            for (i, (origin, secs)) in updates.into_iter().enumerate() {
                let decision = r.apply(update(origin, i64::try_from(i).unwrap(), secs), at(100));
                let state = r.get(&key()).unwrap();

                if let Some(previous) = high_water {
                    prop_assert!(state.last_accepted_at() >= previous);
                    if at(secs) > previous {
                        prop_assert_eq!(decision, Decision::Accepted);
                    }
                    if at(secs) < previous {
                        prop_assert_eq!(decision, Decision::Stale);
                    }
                }
                high_water = Some(state.last_accepted_at());
            }
        }
    }
}
