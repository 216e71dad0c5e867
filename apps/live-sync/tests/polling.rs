//! Polling Integration Tests
//!
//! Runs the polling scheduler with real HTTP fetchers against a mock
//! dashboard API and observes the engine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use live_sync::infrastructure::http::http_client;
use live_sync::infrastructure::push::{PushCodec, PushFrame};
use live_sync::{
    AuthoritativeState, Endpoint, ErrorSink, FetchError, HttpFetcher, LogicalKey, Origin,
    PollingScheduler, SyncEngine, UpdateSink,
};

#[derive(Default)]
struct RecordingErrors(Mutex<Vec<(LogicalKey, FetchError)>>);

impl ErrorSink for RecordingErrors {
    fn report(&self, key: &LogicalKey, error: &FetchError) {
        self.0.lock().push((key.clone(), error.clone()));
    }
}

struct Harness {
    server: MockServer,
    engine: SyncEngine,
    scheduler: PollingScheduler,
    errors: Arc<RecordingErrors>,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        let cancel = CancellationToken::new();
        let (engine, _task) = SyncEngine::spawn(cancel.clone());
        let errors = Arc::new(RecordingErrors::default());
        let scheduler = PollingScheduler::new(
            Arc::new(engine.clone()),
            Arc::clone(&errors) as Arc<dyn ErrorSink>,
            cancel.child_token(),
        );
        Self {
            server: MockServer::start().await,
            engine,
            scheduler,
            errors,
            client: http_client(Duration::from_secs(2)).unwrap(),
            cancel,
        }
    }

    fn schedule(&self, endpoint: Endpoint, interval: Duration) -> LogicalKey {
        let key = endpoint.key.clone();
        let fetcher = HttpFetcher::new(self.client.clone(), &self.server.uri(), endpoint);
        self.scheduler
            .schedule(&key, interval, Arc::new(fetcher))
            .unwrap();
        key
    }

    async fn request_count(&self) -> usize {
        self.server.received_requests().await.unwrap_or_default().len()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn latest_price(pair: &str, price: f64, timestamp: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "currency_pair": pair,
        "price": price,
        "price_type": "buy",
        "timestamp": timestamp,
        "source": "channel"
    }))
}

#[tokio::test]
async fn polled_price_reaches_subscriber() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/data/latest-price"))
        .and(query_param("currency_pair", "USD/LYD"))
        .respond_with(latest_price("USD/LYD", 4.85, "2024-03-01T12:30:00"))
        .mount(&harness.server)
        .await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    harness
        .engine
        .subscribe("USD/LYD", move |state: &AuthoritativeState| {
            let _ = tx.send(state.value().as_number());
        })
        .unwrap();

    harness.schedule(
        Endpoint::latest_price("USD/LYD").unwrap(),
        Duration::from_secs(60),
    );

    let value = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("first tick fires immediately")
        .unwrap();
    assert_eq!(value, Some(Decimal::new(485, 2)));
    assert!(harness.errors.0.lock().is_empty());
}

#[tokio::test]
async fn repeated_identical_polls_notify_once() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .respond_with(latest_price("EUR/LYD", 5.2, "2024-03-01T12:00:00"))
        .mount(&harness.server)
        .await;

    let notified = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&notified);
    harness
        .engine
        .subscribe("EUR/LYD", move |_: &AuthoritativeState| *counter.lock() += 1)
        .unwrap();

    harness.schedule(
        Endpoint::latest_price("EUR/LYD").unwrap(),
        Duration::from_millis(40),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.engine.flush().await.unwrap();

    assert!(harness.request_count().await >= 3);
    assert_eq!(*notified.lock(), 1);
    assert!(harness.engine.stats().await.unwrap().reconciler.duplicate >= 2);
}

#[tokio::test]
async fn failures_go_to_error_sink() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/analysis/panic-index"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/data/latest-price"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "currency_pair": "TND/LYD",
            "price": null,
            "timestamp": null
        })))
        .mount(&harness.server)
        .await;

    let panic_key = harness.schedule(Endpoint::panic_index().unwrap(), Duration::from_secs(60));
    let price_key = harness.schedule(
        Endpoint::latest_price("TND/LYD").unwrap(),
        Duration::from_secs(60),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;

    let errors = harness.errors.0.lock().clone();
    assert!(errors.contains(&(
        panic_key,
        FetchError::Status {
            status: 503,
            body: "down".into()
        }
    )));
    assert!(errors.contains(&(price_key, FetchError::NoData)));
    assert!(harness.engine.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn unschedule_discards_in_flight_result() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .respond_with(
            latest_price("EUR/LYD", 5.2, "2024-03-01T12:00:00")
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&harness.server)
        .await;

    let key = harness.schedule(
        Endpoint::latest_price("EUR/LYD").unwrap(),
        Duration::from_secs(60),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.scheduler.unschedule(&key));
    tokio::time::sleep(Duration::from_millis(400)).await;
    harness.engine.flush().await.unwrap();

    assert!(harness.engine.current(&key).await.unwrap().is_none());
    assert!(harness.errors.0.lock().is_empty());
}

#[tokio::test]
async fn slow_responses_do_not_overlap() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .respond_with(
            latest_price("USD/LYD", 4.9, "2024-03-01T12:00:00")
                .set_delay(Duration::from_millis(250)),
        )
        .mount(&harness.server)
        .await;

    harness.schedule(
        Endpoint::latest_price("USD/LYD").unwrap(),
        Duration::from_millis(50),
    );
    tokio::time::sleep(Duration::from_millis(400)).await;

    let requests = harness.request_count().await;
    assert!(
        (1..=2).contains(&requests),
        "expected at most one request in flight at a time, got {requests}"
    );
}

#[tokio::test]
async fn polled_report_does_not_compete_with_pushed_analysis() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/analysis/complete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "currency_pair": "USD/LYD",
            "forecast": "up",
            "reasoning": "demand"
        })))
        .mount(&harness.server)
        .await;

    // Service clock far ahead of ours.
    let frame = PushCodec::new()
        .decode(
            r#"{"type":"analysis_update","data":{"currency_pair":"USD/LYD","signal":"BUY"},"timestamp":"2099-01-01T00:00:00"}"#,
        )
        .unwrap();
    let PushFrame::Update(pushed) = frame else {
        panic!("expected an update, got {frame:?}");
    };
    let pushed_key = pushed.key().clone();
    assert!(harness.engine.submit(pushed));

    let report_key = harness.schedule(
        Endpoint::complete_analysis("USD/LYD").unwrap(),
        Duration::from_secs(60),
    );
    assert_ne!(report_key, pushed_key);

    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.engine.flush().await.unwrap();

    let report = harness.engine.current(&report_key).await.unwrap().unwrap();
    assert_eq!(report.update().origin(), Origin::Poll);
    let analysis = harness.engine.current(&pushed_key).await.unwrap().unwrap();
    assert_eq!(analysis.update().origin(), Origin::Push);
    assert_eq!(harness.engine.stats().await.unwrap().reconciler.stale, 0);
    assert!(harness.errors.0.lock().is_empty());
}
