//! Value Update Types
//!
//! The immutable records that flow from producers (push channel, polling
//! tasks) into the reconciler, and the per-key state the reconciler keeps.
//!
//! # Keys
//!
//! A [`LogicalKey`] names one independently tracked stream. Price streams use
//! the bare currency pair (`USD/LYD`); derived streams are prefixed with their
//! [`DataKind`] (`signal:USD/LYD`, `analysis:USD/LYD`) so that a push frame and
//! a poll response for the same stream reconcile against each other.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

// =============================================================================
// Logical Key
// =============================================================================

/// Error returned when a logical key cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The key was empty or whitespace only.
    #[error("logical key must not be empty")]
    Empty,
}

/// Identifier of one independently tracked data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LogicalKey(String);

impl LogicalKey {
    /// Create a key, rejecting empty or whitespace-only input.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Empty`] if `raw` has no visible characters.
    pub fn new(raw: impl Into<String>) -> Result<Self, KeyError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(raw))
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LogicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for LogicalKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for LogicalKey {
    type Error = KeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for LogicalKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

// =============================================================================
// Data Kinds
// =============================================================================

/// The kinds of data the dashboard panels display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// Latest price of a currency pair (ticker).
    Price,
    /// Buy/sell signal for a currency pair.
    Signal,
    /// Analysis pushed by the service for a currency pair.
    Analysis,
    /// Complete analysis report (forecast, reasoning) polled for a pair.
    ///
    /// Stamped on receipt, so it never shares a key with pushed analysis.
    Report,
    /// Daily OHLC history for a currency pair (chart).
    Daily,
    /// Recent channel messages (news feed). Not pair specific.
    Messages,
    /// Market panic index. Not pair specific.
    PanicIndex,
}

impl DataKind {
    /// Build the logical key for this kind of data.
    ///
    /// Pair-less kinds ignore `pair`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Empty`] if a pair-specific kind is given an empty pair.
    pub fn key_for(self, pair: &str) -> Result<LogicalKey, KeyError> {
        match self {
            Self::Price => LogicalKey::new(pair),
            Self::Signal | Self::Analysis | Self::Report | Self::Daily => {
                if pair.trim().is_empty() {
                    return Err(KeyError::Empty);
                }
                LogicalKey::new(format!("{}:{pair}", self.as_str()))
            }
            Self::Messages | Self::PanicIndex => LogicalKey::new(self.as_str()),
        }
    }

    /// Default polling cadence for panels showing this kind.
    #[must_use]
    pub const fn default_interval(self) -> Duration {
        match self {
            Self::Price => Duration::from_secs(5),
            Self::Messages => Duration::from_secs(10),
            Self::Signal | Self::PanicIndex => Duration::from_secs(30),
            Self::Analysis | Self::Report | Self::Daily => Duration::from_secs(60),
        }
    }

    /// Stable name used in keys and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Signal => "signal",
            Self::Analysis => "analysis",
            Self::Report => "report",
            Self::Daily => "daily",
            Self::Messages => "messages",
            Self::PanicIndex => "panic-index",
        }
    }
}

// =============================================================================
// Values
// =============================================================================

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Persistent push channel.
    Push,
    /// Periodic pull request.
    Poll,
}

impl Origin {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll => "poll",
        }
    }
}

/// A value carried by an update: a number or an arbitrary JSON record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SyncValue {
    /// Numeric value such as a price.
    Number(Decimal),
    /// Structured payload such as a signal or a message list.
    Record(serde_json::Value),
}

impl SyncValue {
    /// Convert a JSON value, keeping numbers (and numeric strings) as decimals.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match &value {
            serde_json::Value::Number(n) => {
                decimal_from_str(&n.to_string()).map_or(Self::Record(value), Self::Number)
            }
            serde_json::Value::String(s) => {
                decimal_from_str(s).map_or(Self::Record(value), Self::Number)
            }
            _ => Self::Record(value),
        }
    }

    /// The numeric value, if this is a number.
    #[must_use]
    pub const fn as_number(&self) -> Option<Decimal> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Record(_) => None,
        }
    }

    /// The record, if this is not a number.
    #[must_use]
    pub const fn as_record(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Number(_) => None,
            Self::Record(r) => Some(r),
        }
    }
}

fn decimal_from_str(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// One observation of a key's value. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueUpdate {
    key: LogicalKey,
    value: SyncValue,
    observed_at: DateTime<Utc>,
    origin: Origin,
}

impl ValueUpdate {
    /// Create a new update.
    #[must_use]
    pub const fn new(
        key: LogicalKey,
        value: SyncValue,
        observed_at: DateTime<Utc>,
        origin: Origin,
    ) -> Self {
        Self {
            key,
            value,
            observed_at,
            origin,
        }
    }

    /// Create an update that arrived over the push channel.
    #[must_use]
    pub const fn push(key: LogicalKey, value: SyncValue, observed_at: DateTime<Utc>) -> Self {
        Self::new(key, value, observed_at, Origin::Push)
    }

    /// Create an update produced by a polling request.
    #[must_use]
    pub const fn poll(key: LogicalKey, value: SyncValue, observed_at: DateTime<Utc>) -> Self {
        Self::new(key, value, observed_at, Origin::Poll)
    }

    /// The key this update belongs to.
    #[must_use]
    pub const fn key(&self) -> &LogicalKey {
        &self.key
    }

    /// The carried value.
    #[must_use]
    pub const fn value(&self) -> &SyncValue {
        &self.value
    }

    /// When the remote service observed the value.
    #[must_use]
    pub const fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Which channel produced the update.
    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }
}

// =============================================================================
// Authoritative State
// =============================================================================

/// The last accepted update for a key.
///
/// Consumers only ever receive clones of this; the reconciler owns the
/// original.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthoritativeState {
    update: ValueUpdate,
    received_at: DateTime<Utc>,
}

impl AuthoritativeState {
    /// Wrap an accepted update.
    #[must_use]
    pub const fn new(update: ValueUpdate, received_at: DateTime<Utc>) -> Self {
        Self {
            update,
            received_at,
        }
    }

    /// The accepted update.
    #[must_use]
    pub const fn update(&self) -> &ValueUpdate {
        &self.update
    }

    /// Shortcut for the accepted value.
    #[must_use]
    pub const fn value(&self) -> &SyncValue {
        self.update.value()
    }

    /// `observed_at` of the accepted update.
    #[must_use]
    pub const fn last_accepted_at(&self) -> DateTime<Utc> {
        self.update.observed_at()
    }

    /// Local wall-clock time at which the update was accepted.
    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Time since the value was accepted locally.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.received_at
    }

    /// Whether the value has not been refreshed within `max_age`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        chrono::Duration::from_std(max_age).is_ok_and(|max| self.age(now) > max)
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Parse a remote timestamp.
///
/// Accepts RFC 3339 and naive ISO-8601 (no offset, interpreted as UTC), which
/// is what the dashboard service emits.
#[must_use]
pub fn parse_observed_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| {
            NaiveDateTime::parse_from_str(raw, fmt).ok().or_else(|| {
                chrono::NaiveDate::parse_from_str(raw, fmt)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
        })
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn empty_key_rejected() {
        assert_eq!(LogicalKey::new(""), Err(KeyError::Empty));
        assert_eq!(LogicalKey::new("   "), Err(KeyError::Empty));
        assert!(LogicalKey::new("USD/LYD").is_ok());
    }

    #[test]
    fn data_kind_keys() {
        assert_eq!(DataKind::Price.key_for("USD/LYD").unwrap().as_str(), "USD/LYD");
        assert_eq!(
            DataKind::Signal.key_for("EUR/LYD").unwrap().as_str(),
            "signal:EUR/LYD"
        );
        assert_eq!(DataKind::Messages.key_for("").unwrap().as_str(), "messages");
        assert_eq!(DataKind::Analysis.key_for(" "), Err(KeyError::Empty));
        assert_ne!(
            DataKind::Report.key_for("USD/LYD"),
            DataKind::Analysis.key_for("USD/LYD")
        );
    }

    #[test]
    fn sync_value_from_json() {
        let n = SyncValue::from_json(serde_json::json!(4.85));
        assert_eq!(n.as_number(), Some(Decimal::new(485, 2)));

        let s = SyncValue::from_json(serde_json::json!("7.125"));
        assert_eq!(s.as_number(), Some(Decimal::new(7125, 3)));

        let r = SyncValue::from_json(serde_json::json!({"signal": "BUY"}));
        assert!(r.as_record().is_some());

        let text = SyncValue::from_json(serde_json::json!("HOLD"));
        assert_eq!(text.as_record(), Some(&serde_json::json!("HOLD")));
    }

    #[test]
    fn parse_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_observed_at("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_observed_at("2024-03-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_observed_at("2024-03-01T12:30:00"), Some(expected));
        assert_eq!(
            parse_observed_at("2024-03-01T12:30:00.250000"),
            Some(expected + chrono::Duration::milliseconds(250))
        );
        assert_eq!(
            parse_observed_at("2024-03-01"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_observed_at("yesterday"), None);
    }

    #[test]
    fn staleness() {
        let key = LogicalKey::new("USD/LYD").unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let state = AuthoritativeState::new(
            ValueUpdate::poll(key, SyncValue::Number(Decimal::ONE), t0),
            t0,
        );

        let later = t0 + chrono::Duration::seconds(10);
        assert!(!state.is_stale(later, Duration::from_secs(30)));
        assert!(state.is_stale(later, Duration::from_secs(5)));
        assert_eq!(state.age(later), chrono::Duration::seconds(10));
    }
}
