//! Sync Configuration Settings
//!
//! Configuration types for the sync core, loaded from environment variables.

use std::time::Duration;

use reqwest::Url;

use crate::domain::connection::BackoffConfig;
use crate::infrastructure::push::{KeepaliveConfig, PUSH_PATH};

/// Default REST API base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Default WebSocket base URL.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000";

/// Pairs tracked when `LIVE_SYNC_PAIRS` is unset.
pub const DEFAULT_PAIRS: [&str; 4] = ["USD/LYD", "EUR/LYD", "Gold/LYD", "TND/LYD"];

/// Upstream endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// REST API base URL.
    pub api_url: String,
    /// WebSocket base URL.
    pub ws_url: String,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Poll cadences per panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Ticker prices.
    pub ticker: Duration,
    /// Trading signals and the panic index.
    pub signal: Duration,
    /// Message feed.
    pub feed: Duration,
    /// Complete analysis and daily history.
    pub analysis: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            ticker: Duration::from_secs(5),
            signal: Duration::from_secs(30),
            feed: Duration::from_secs(10),
            analysis: Duration::from_secs(60),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upstream endpoints.
    pub endpoints: EndpointSettings,
    /// Push channel keepalive.
    pub keepalive: KeepaliveConfig,
    /// Push channel reconnect backoff.
    pub backoff: BackoffConfig,
    /// Poll cadences.
    pub poll: PollSettings,
    /// Tracked currency pairs.
    pub pairs: Vec<String>,
    /// Server ports.
    pub server: ServerSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointSettings::default(),
            keepalive: KeepaliveConfig::default(),
            backoff: BackoffConfig::default(),
            poll: PollSettings::default(),
            pairs: DEFAULT_PAIRS.iter().map(ToString::to_string).collect(),
            server: ServerSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is invalid, the pair list is empty or a
    /// value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// Unparseable numbers fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is invalid, the pair list is empty, a
    /// keepalive duration is zero or the jitter is outside `[0, 1]`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let endpoints = EndpointSettings {
            api_url: env.url("LIVE_SYNC_API_URL", &["http", "https"], defaults.endpoints.api_url)?,
            ws_url: env.url("LIVE_SYNC_WS_URL", &["ws", "wss"], defaults.endpoints.ws_url)?,
            http_timeout: env.secs("LIVE_SYNC_HTTP_TIMEOUT_SECS", defaults.endpoints.http_timeout),
        };

        let keepalive = KeepaliveConfig::new(
            env.non_zero_secs("LIVE_SYNC_KEEPALIVE_INTERVAL_SECS", defaults.keepalive.interval)?,
            env.non_zero_secs("LIVE_SYNC_KEEPALIVE_TIMEOUT_SECS", defaults.keepalive.timeout)?,
        );

        let backoff = BackoffConfig::new(
            env.millis("LIVE_SYNC_BACKOFF_BASE_MS", defaults.backoff.base),
            env.millis("LIVE_SYNC_BACKOFF_CAP_MS", defaults.backoff.cap),
            env.parse("LIVE_SYNC_BACKOFF_MULTIPLIER", defaults.backoff.multiplier),
        )
        .with_jitter(env.fraction("LIVE_SYNC_BACKOFF_JITTER", defaults.backoff.jitter_factor)?);

        let poll = PollSettings {
            ticker: env.millis("LIVE_SYNC_TICKER_POLL_MS", defaults.poll.ticker),
            signal: env.millis("LIVE_SYNC_SIGNAL_POLL_MS", defaults.poll.signal),
            feed: env.millis("LIVE_SYNC_FEED_POLL_MS", defaults.poll.feed),
            analysis: env.millis("LIVE_SYNC_ANALYSIS_POLL_MS", defaults.poll.analysis),
        };

        let pairs = match env.get("LIVE_SYNC_PAIRS") {
            Some(raw) => {
                let pairs: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(ToString::to_string)
                    .collect();
                if pairs.is_empty() {
                    return Err(ConfigError::EmptyValue("LIVE_SYNC_PAIRS".to_string()));
                }
                pairs
            }
            None => defaults.pairs,
        };

        let server = ServerSettings {
            health_port: env.parse("LIVE_SYNC_HEALTH_PORT", defaults.server.health_port),
        };

        Ok(Self {
            endpoints,
            keepalive,
            backoff,
            poll,
            pairs,
            server,
        })
    }

    /// Full push channel URL.
    #[must_use]
    pub fn push_url(&self) -> String {
        format!(
            "{}{PUSH_PATH}",
            self.endpoints.ws_url.trim_end_matches('/')
        )
    }

    /// REST base URL without a trailing slash.
    #[must_use]
    pub fn api_base(&self) -> &str {
        self.endpoints.api_url.trim_end_matches('/')
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),

    /// Environment variable is not a usable URL.
    #[error("environment variable {var} is not a valid URL: {reason}")]
    InvalidUrl {
        /// Variable name.
        var: &'static str,
        /// Parse or scheme failure.
        reason: String,
    },

    /// Environment variable parsed but is not an allowed value.
    #[error("environment variable {var} is out of range: {reason}")]
    OutOfRange {
        /// Variable name.
        var: &'static str,
        /// Allowed range.
        reason: &'static str,
    },
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn non_zero_secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let secs = self.secs(key, default);
        if secs.is_zero() {
            return Err(ConfigError::OutOfRange {
                var: key,
                reason: "must be at least one second",
            });
        }
        Ok(secs)
    }

    fn fraction(&self, key: &'static str, default: f64) -> Result<f64, ConfigError> {
        let value = self.parse(key, default);
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::OutOfRange {
                var: key,
                reason: "must be a number between 0 and 1",
            });
        }
        Ok(value)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn url(&self, key: &'static str, schemes: &[&str], default: String) -> Result<String, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
            var: key,
            reason: e.to_string(),
        })?;
        if !schemes.contains(&url.scheme()) {
            return Err(ConfigError::InvalidUrl {
                var: key,
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        Ok(raw.to_string())
    }
}
