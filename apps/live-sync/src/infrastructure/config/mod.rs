//! Configuration Module
//!
//! Environment-driven configuration for the sync service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_API_URL, DEFAULT_PAIRS, DEFAULT_WS_URL, EndpointSettings, PollSettings,
    ServerSettings, SyncConfig,
};
