//! HTTP Fetcher
//!
//! [`Fetcher`] adapter issuing one GET per poll tick against the dashboard
//! REST API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::endpoint::Endpoint;
use crate::application::ports::{FetchError, Fetcher};
use crate::domain::update::ValueUpdate;

/// Longest error body kept in [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Build the shared HTTP client.
///
/// # Errors
///
/// Returns [`FetchError::Network`] if the client cannot be built.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FetchError::Network(e.to_string()))
}

/// Polls one [`Endpoint`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    endpoint: Endpoint,
}

impl HttpFetcher {
    /// Create a fetcher for `endpoint` under `base_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, endpoint: Endpoint) -> Self {
        let url = format!("{}{}", base_url.trim_end_matches('/'), endpoint.path);
        Self {
            client,
            url,
            endpoint,
        }
    }

    /// The endpoint being polled.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Full request URL without the query.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self) -> Result<ValueUpdate, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .query(&self.endpoint.query)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let mut body = response.text().await.unwrap_or_default();
            truncate(&mut body, MAX_ERROR_BODY);
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        (self.endpoint.extractor)(&self.endpoint.key, body, Utc::now())
    }
}

fn truncate(body: &mut String, max: usize) {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::update::Origin;

    fn fetcher(server: &MockServer, endpoint: Endpoint) -> HttpFetcher {
        let client = http_client(Duration::from_secs(2)).unwrap();
        HttpFetcher::new(client, &server.uri(), endpoint)
    }

    #[tokio::test]
    async fn fetches_latest_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/data/latest-price"))
            .and(query_param("currency_pair", "USD/LYD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "currency_pair": "USD/LYD",
                "price": 4.85,
                "price_type": "buy",
                "timestamp": "2024-03-01T12:30:00",
                "source": "channel"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let update = fetcher(&server, Endpoint::latest_price("USD/LYD").unwrap())
            .fetch()
            .await
            .unwrap();

        assert_eq!(update.key().as_str(), "USD/LYD");
        assert_eq!(update.value().as_number(), Some(Decimal::new(485, 2)));
        assert_eq!(update.origin(), Origin::Poll);
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = fetcher(&server, Endpoint::panic_index().unwrap())
            .fetch()
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::Status {
                status: 503,
                body: "maintenance".into()
            }
        );
    }

    #[tokio::test]
    async fn invalid_json_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = fetcher(&server, Endpoint::messages(10).unwrap())
            .fetch()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "malformed");
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() {
        let client = http_client(Duration::from_millis(500)).unwrap();
        let fetcher = HttpFetcher::new(
            client,
            "http://127.0.0.1:9",
            Endpoint::panic_index().unwrap(),
        );
        assert_eq!(fetcher.fetch().await.unwrap_err().kind(), "network");
    }

    #[test]
    fn url_joins_base_and_path() {
        let client = http_client(Duration::from_secs(1)).unwrap();
        let fetcher = HttpFetcher::new(
            client,
            "http://localhost:8000/",
            Endpoint::signal("USD/LYD").unwrap(),
        );
        assert_eq!(fetcher.url(), "http://localhost:8000/api/v1/analysis/signal");
    }

    #[test]
    fn truncates_on_char_boundary() {
        let mut body = "é".repeat(10);
        truncate(&mut body, 5);
        assert_eq!(body, "éé");
    }
}
