//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports and the service's
//! operational surface.

/// WebSocket push channel client.
pub mod push;

/// REST pull endpoints and the HTTP fetcher.
pub mod http;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
