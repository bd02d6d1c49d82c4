//! HTTP broker [`QueueTransport`].
//!
//! Sends each batch as one request:
//!
//! ```text
//! POST {endpoint}/queues/{queue}/messages
//! {"messages":[<message>,<message>,...]}
//! ```
//!
//! The body is assembled from the already-serialized messages, so its size
//! is exactly what [`BatchFraming`] accounts for.
//!
//! | Response | Error |
//! |----------|-------|
//! | 2xx | – |
//! | connect / timeout, 502, 503, 504 | [`Error::TransientInfra`] |
//! | 413 | [`Error::MessageTooLarge`] |
//! | other | [`Error::ExternalService`] |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::QueueConfig;
use crate::error::{classify_http_error, Error, Result};

use super::{BatchFraming, QueueTransport};

const ENVELOPE_OPEN: &str = "{\"messages\":[";
const ENVELOPE_CLOSE: &str = "]}";

pub struct HttpQueue {
    endpoint: String,
    max_batch_bytes: usize,
    client: reqwest::Client,
}

impl HttpQueue {
    pub fn new(endpoint: &str, max_batch_bytes: usize, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build queue client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            max_batch_bytes,
            client,
        })
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            Error::Configuration("queue.endpoint is required for the http queue backend".into())
        })?;
        Self::new(
            endpoint,
            config.max_batch_bytes,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl QueueTransport for HttpQueue {
    fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes
    }

    fn batch_framing(&self) -> BatchFraming {
        BatchFraming {
            envelope: ENVELOPE_OPEN.len() + ENVELOPE_CLOSE.len(),
            separator: 1,
        }
    }

    async fn send_batch(&self, queue: &str, batch: &[String]) -> Result<()> {
        let body = envelope(batch);
        let url = format!("{}/queues/{}/messages", self.endpoint, queue);

        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| classify_http_error(&format!("queue '{}'", queue), e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = resp.text().await.unwrap_or_default();
        let detail: String = detail.chars().take(300).collect();
        match status {
            StatusCode::PAYLOAD_TOO_LARGE => Err(Error::MessageTooLarge {
                size: envelope(batch).len(),
                limit: self.max_batch_bytes,
            }),
            StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Err(Error::TransientInfra(format!(
                "queue '{}' returned HTTP {}: {}",
                queue, status, detail
            ))),
            _ => Err(Error::ExternalService(format!(
                "queue '{}' returned HTTP {}: {}",
                queue, status, detail
            ))),
        }
    }
}

fn envelope(batch: &[String]) -> String {
    format!("{}{}{}", ENVELOPE_OPEN, batch.join(","), ENVELOPE_CLOSE)
}
