//! Application Layer - Services and port definitions.
//!
//! This layer contains the sync engine, the polling scheduler and the port
//! interfaces they use to reach producers and reporting sinks.

/// Port interfaces for fetchers, update sinks and error sinks.
pub mod ports;

/// Sync engine and polling scheduler.
pub mod services;
