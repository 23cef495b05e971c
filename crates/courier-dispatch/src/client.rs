//! HTTP client for worker delivery.
//!
//! Posts the raw JSON message body to the worker endpoint with
//! `Content-Type: application/json` and reports the status code. The
//! client never retries and never errors on a delivery attempt: transport
//! failures (DNS, connect refused, TLS, timeout) are normalized to a
//! synthetic 500 so the dispatcher sees only status classes. Message
//! headers are not transmitted; the worker contract is the body alone.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DispatchError, Result};

/// Status reported for attempts that never produced an HTTP response.
pub const SYNTHETIC_FAILURE_STATUS: u16 = 500;

/// Configuration for the worker delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout. Must stay below the lease timeout so an
    /// attempt always resolves before its lease can be considered
    /// abandoned.
    pub timeout: Duration,

    /// User agent string for outbound requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_HTTP_TIMEOUT_SECONDS),
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptOutcome {
    /// HTTP status code; `SYNTHETIC_FAILURE_STATUS` for transport errors.
    pub status: u16,

    /// Wall-clock duration of the attempt.
    pub duration: Duration,
}

impl AttemptOutcome {
    /// True for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client for posting deliveries to worker endpoints.
///
/// Uses connection pooling so many queues can share one client. Retry
/// policy lives entirely in the dispatcher; this layer performs exactly
/// one request per call.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WorkerClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DispatchError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Posts a message body to a worker endpoint.
    ///
    /// Always produces an outcome: any failure to obtain an HTTP response
    /// within the configured timeout is reported as the synthetic failure
    /// status.
    pub async fn deliver(&self, endpoint: &str, body: &serde_json::Value) -> AttemptOutcome {
        let start = std::time::Instant::now();

        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await;

        let duration = start.elapsed();

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(endpoint, status, duration_ms = duration.as_millis(), "delivery attempt");
                AttemptOutcome { status, duration }
            },
            Err(error) => {
                warn!(
                    endpoint,
                    timed_out = error.is_timeout(),
                    duration_ms = duration.as_millis(),
                    "delivery attempt failed in transport: {error}"
                );
                AttemptOutcome { status: SYNTHETIC_FAILURE_STATUS, duration }
            },
        }
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn successful_delivery_reports_status() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::body_json(json!({"n": 1})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = WorkerClient::with_defaults().unwrap();
        let outcome = client.deliver(&format!("{}/hook", mock_server.uri()), &json!({"n": 1})).await;

        assert_eq!(outcome.status, 200);
        assert!(outcome.is_success());
        mock_server.verify().await;
    }

    #[tokio::test]
    async fn non_2xx_statuses_are_reported_verbatim() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = WorkerClient::with_defaults().unwrap();
        let outcome = client.deliver(&format!("{}/hook", mock_server.uri()), &json!({})).await;

        assert_eq!(outcome.status, 404);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn connection_refused_becomes_synthetic_500() {
        let client = WorkerClient::with_defaults().unwrap();
        // Port 1 is never listening.
        let outcome = client.deliver("http://127.0.0.1:1/hook", &json!({})).await;

        assert_eq!(outcome.status, SYNTHETIC_FAILURE_STATUS);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn timeout_becomes_synthetic_500() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let config = ClientConfig { timeout: Duration::from_millis(200), ..Default::default() };
        let client = WorkerClient::new(config).unwrap();
        let outcome = client.deliver(&format!("{}/hook", mock_server.uri()), &json!({})).await;

        assert_eq!(outcome.status, SYNTHETIC_FAILURE_STATUS);
    }

    #[test]
    fn status_classes_partition_success() {
        let success = AttemptOutcome { status: 204, duration: Duration::ZERO };
        assert!(success.is_success());

        for status in [199, 300, 404, 429, 500, 503] {
            let failure = AttemptOutcome { status, duration: Duration::ZERO };
            assert!(!failure.is_success(), "{status} must not be a success");
        }
    }
}
