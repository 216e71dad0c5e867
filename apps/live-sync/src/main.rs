//! Live Sync Binary
//!
//! Runs the sync core against the dashboard service and logs every
//! authoritative value as it changes.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin live-sync
//! ```
//!
//! # Environment Variables
//!
//! - `LIVE_SYNC_API_URL`: REST base URL (default: <http://localhost:8000>)
//! - `LIVE_SYNC_WS_URL`: WebSocket base URL (default: ws://localhost:8000)
//! - `LIVE_SYNC_PAIRS`: Comma-separated currency pairs
//! - `LIVE_SYNC_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `LIVE_SYNC_*_POLL_MS`, `LIVE_SYNC_BACKOFF_*`, `LIVE_SYNC_KEEPALIVE_*`: tuning
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use live_sync::infrastructure::health::{HealthServer, HealthServerState};
use live_sync::infrastructure::http::{
    DEFAULT_HISTORY_DAYS, DEFAULT_MESSAGE_LIMIT, Endpoint, HttpFetcher, http_client,
};
use live_sync::infrastructure::telemetry;
use live_sync::{
    AuthoritativeState, PollingScheduler, PushClient, PushClientConfig, SyncConfig, SyncEngine,
    TracingErrorSink, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting live sync");

    let _metrics_handle = init_metrics().context("failed to initialize metrics")?;

    let config = SyncConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let (engine, engine_task) = SyncEngine::spawn(shutdown_token.clone());

    // Push channel
    let push_config = PushClientConfig::new(config.push_url())
        .with_keepalive(config.keepalive)
        .with_backoff(config.backoff);
    let push = Arc::new(PushClient::new(
        push_config,
        Arc::new(engine.clone()),
        &shutdown_token,
    ));
    push.start();

    // Pull channel
    let client = http_client(config.endpoints.http_timeout)?;
    let scheduler = Arc::new(PollingScheduler::new(
        Arc::new(engine.clone()),
        Arc::new(TracingErrorSink),
        shutdown_token.child_token(),
    ));

    let mut handles = Vec::new();
    for endpoint in endpoints(&config)? {
        let key = endpoint.key.clone();
        let interval = endpoint.interval;
        let fetcher = HttpFetcher::new(client.clone(), config.api_base(), endpoint);
        scheduler.schedule(&key, interval, Arc::new(fetcher))?;
        handles.push(engine.subscribe(&key, log_value)?);
    }

    // Health server
    let health_task = (config.server.health_port != 0).then(|| {
        let state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            engine.clone(),
            Arc::clone(&push),
            Arc::clone(&scheduler),
        ));
        let server = HealthServer::new(config.server.health_port, state, shutdown_token.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        })
    });

    tracing::info!(keys = handles.len(), "Live sync ready");

    if let Err(e) = await_shutdown().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signals");
    }

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );

    let stopped = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        push.shutdown().await;
        scheduler.shutdown();
        for handle in &handles {
            engine.unsubscribe(handle);
        }
        let _ = engine.flush().await;
        shutdown_token.cancel();
        let _ = engine_task.await;
        if let Some(task) = health_task {
            let _ = task.await;
        }
    })
    .await;

    if stopped.is_err() {
        tracing::warn!("Shutdown timed out");
    }

    tracing::info!("Live sync stopped");
    Ok(())
}

/// Every endpoint the dashboard polls.
fn endpoints(config: &SyncConfig) -> anyhow::Result<Vec<Endpoint>> {
    let poll = config.poll;
    let mut endpoints = Vec::with_capacity(config.pairs.len() * 4 + 2);

    for pair in &config.pairs {
        endpoints.push(Endpoint::latest_price(pair)?.with_interval(poll.ticker));
        endpoints.push(Endpoint::signal(pair)?.with_interval(poll.signal));
        endpoints.push(Endpoint::complete_analysis(pair)?.with_interval(poll.analysis));
        endpoints.push(Endpoint::daily(pair, DEFAULT_HISTORY_DAYS)?.with_interval(poll.analysis));
    }
    endpoints.push(Endpoint::messages(DEFAULT_MESSAGE_LIMIT)?.with_interval(poll.feed));
    endpoints.push(Endpoint::panic_index()?.with_interval(poll.signal));

    Ok(endpoints)
}

fn log_value(state: &AuthoritativeState) {
    let update = state.update();
    match update.value().as_number() {
        Some(number) => tracing::info!(
            key = %update.key(),
            origin = update.origin().as_str(),
            value = %number,
            observed_at = %update.observed_at(),
            "Value updated"
        ),
        None => tracing::info!(
            key = %update.key(),
            origin = update.origin().as_str(),
            observed_at = %update.observed_at(),
            "Record updated"
        ),
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    tracing::info!(
        api_url = config.api_base(),
        push_url = %config.push_url(),
        pairs = ?config.pairs,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        ticker_ms = u64::try_from(config.poll.ticker.as_millis()).unwrap_or(u64::MAX),
        signal_ms = u64::try_from(config.poll.signal.as_millis()).unwrap_or(u64::MAX),
        feed_ms = u64::try_from(config.poll.feed.as_millis()).unwrap_or(u64::MAX),
        analysis_ms = u64::try_from(config.poll.analysis.as_millis()).unwrap_or(u64::MAX),
        "Poll cadences"
    );
}

/// Wait for SIGTERM or SIGINT.
#[cfg(unix)]
async fn await_shutdown() -> std::io::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate.recv() => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
    Ok(())
}

/// Wait for Ctrl+C.
#[cfg(not(unix))]
async fn await_shutdown() -> std::io::Result<()> {
    signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, initiating shutdown");
    Ok(())
}
