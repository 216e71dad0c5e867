//! Pull Endpoints
//!
//! Presets for the dashboard's REST endpoints. Each preset knows its path,
//! query, logical key, default cadence and how to extract an update.

use std::fmt;
use std::time::Duration;

use super::extract::{self, Extractor, TimestampSource};
use crate::domain::update::{DataKind, KeyError, LogicalKey};

/// Default number of messages requested by the news feed.
pub const DEFAULT_MESSAGE_LIMIT: u32 = 50;

/// Default history window for the chart, in days.
pub const DEFAULT_HISTORY_DAYS: u32 = 30;

/// One pollable REST endpoint.
#[derive(Clone)]
pub struct Endpoint {
    /// What the endpoint serves.
    pub kind: DataKind,
    /// Logical key its updates belong to.
    pub key: LogicalKey,
    /// Path relative to the API base URL.
    pub path: &'static str,
    /// Query parameters.
    pub query: Vec<(&'static str, String)>,
    /// Default polling cadence.
    pub interval: Duration,
    /// Body-to-update function.
    pub extractor: Extractor,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Ticker price for a pair.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if `pair` is empty.
    pub fn latest_price(pair: &str) -> Result<Self, KeyError> {
        Ok(Self {
            kind: DataKind::Price,
            key: DataKind::Price.key_for(pair)?,
            path: "/api/v1/data/latest-price",
            query: vec![("currency_pair", pair.to_string())],
            interval: DataKind::Price.default_interval(),
            extractor: extract::latest_price(),
        })
    }

    /// Trading signal for a pair. The service does not timestamp it.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if `pair` is empty.
    pub fn signal(pair: &str) -> Result<Self, KeyError> {
        Ok(Self {
            kind: DataKind::Signal,
            key: DataKind::Signal.key_for(pair)?,
            path: "/api/v1/analysis/signal",
            query: vec![("currency_pair", pair.to_string())],
            interval: DataKind::Signal.default_interval(),
            extractor: extract::record(TimestampSource::ReceivedAt),
        })
    }

    /// Complete analysis for a pair. The service does not timestamp it, so
    /// it lives under its own key rather than the pushed analysis key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if `pair` is empty.
    pub fn complete_analysis(pair: &str) -> Result<Self, KeyError> {
        Ok(Self {
            kind: DataKind::Report,
            key: DataKind::Report.key_for(pair)?,
            path: "/api/v1/analysis/complete",
            query: vec![("currency_pair", pair.to_string())],
            interval: DataKind::Report.default_interval(),
            extractor: extract::record(TimestampSource::ReceivedAt),
        })
    }

    /// Daily history for a pair over the last `days`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if `pair` is empty.
    pub fn daily(pair: &str, days: u32) -> Result<Self, KeyError> {
        Ok(Self {
            kind: DataKind::Daily,
            key: DataKind::Daily.key_for(pair)?,
            path: "/api/v1/data/daily",
            query: vec![
                ("currency_pair", pair.to_string()),
                ("days", days.to_string()),
            ],
            interval: DataKind::Daily.default_interval(),
            extractor: extract::newest_item("date"),
        })
    }

    /// Most recent channel messages.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible like the other presets.
    pub fn messages(limit: u32) -> Result<Self, KeyError> {
        Ok(Self {
            kind: DataKind::Messages,
            key: DataKind::Messages.key_for("")?,
            path: "/api/v1/data/messages",
            query: vec![("limit", limit.to_string())],
            interval: DataKind::Messages.default_interval(),
            extractor: extract::newest_item("timestamp"),
        })
    }

    /// Market panic index.
    ///
    /// # Errors
    ///
    /// Infallible in practice; kept fallible like the other presets.
    pub fn panic_index() -> Result<Self, KeyError> {
        Ok(Self {
            kind: DataKind::PanicIndex,
            key: DataKind::PanicIndex.key_for("")?,
            path: "/api/v1/analysis/panic-index",
            query: Vec::new(),
            interval: DataKind::PanicIndex.default_interval(),
            extractor: extract::record(TimestampSource::Field("timestamp")),
        })
    }

    /// Override the polling cadence.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }
}
