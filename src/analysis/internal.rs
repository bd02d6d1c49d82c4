//! HTTP proxy to the internal analysis API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::models::{AnalysisRequest, AnalysisResponse};

use super::Analyzer;

pub struct InternalApiAnalyzer {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl InternalApiAnalyzer {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build analysis client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn post<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> Result<AnalysisResponse> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("cannot reach {}: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(url = %url, status = status.as_u16(), "internal API returned an error");
            return Err(Error::ExternalService(format!(
                "{} returned HTTP {}: {}",
                endpoint,
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        resp.json::<AnalysisResponse>().await.map_err(|e| {
            Error::ExternalService(format!("{} returned an invalid body: {}", endpoint, e))
        })
    }
}

#[derive(Serialize)]
struct ChainedBody<'a> {
    model: &'a str,
    prompt: &'a str,
    previous_response_id: &'a str,
}

#[derive(Serialize)]
struct FileBody<'a> {
    blob_url: &'a str,
    prompt: &'a str,
    model: &'a str,
}

#[async_trait]
impl Analyzer for InternalApiAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse> {
        self.post(
            "request-with-file",
            &FileBody {
                blob_url: &request.blob_reference,
                prompt: &request.prompt,
                model: &request.model,
            },
        )
        .await
    }

    async fn continue_chain(
        &self,
        model: &str,
        prompt: &str,
        previous_response_id: &str,
    ) -> Result<AnalysisResponse> {
        self.post(
            "chained-request",
            &ChainedBody {
                model,
                prompt,
                previous_response_id,
            },
        )
        .await
    }
}
