//! External analysis collaborator.
//!
//! The pipeline treats content analysis as a black box behind the
//! [`Analyzer`] trait: a document reference plus instructions go in, free-form
//! text plus an opaque response id come out.
//!
//! # Implementations
//!
//! | Type | Provider | Transport |
//! |------|----------|-----------|
//! | [`InternalApiAnalyzer`] | `internal` | `POST {base}/request-with-file`, `POST {base}/chained-request` |
//! | [`OpenAiAnalyzer`] | `openai` | OpenAI files + responses APIs, driven by a [`StrategyChain`] with page-image and text fallbacks |

pub mod chain;
pub mod internal;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AnalysisProvider, Config};
use crate::error::Result;
use crate::models::{AnalysisRequest, AnalysisResponse};
use crate::paths::PathLayout;
use crate::storage::BlobStore;

pub use chain::{AnalysisStrategy, StrategyChain, StrategyInput};
pub use internal::InternalApiAnalyzer;
pub use openai::{OpenAiAnalyzer, OpenAiClient, PageRenderer, PdfiumRenderer};

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze one document.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse>;

    /// Follow up on an earlier response.
    async fn continue_chain(
        &self,
        model: &str,
        prompt: &str,
        previous_response_id: &str,
    ) -> Result<AnalysisResponse>;
}

/// Phrases models use when they could not read a document.
const UNREADABLE_MARKERS: &[&str] = &[
    "could not read",
    "no text",
    "no content",
    "no pude leer",
    "no se pudo leer",
    "no he podido leer",
];

/// Whether a response signals that the document was not actually read:
/// blank, a refusal phrase, or a JSON object whose `result_key` entry is an
/// empty array (`{"dispensas": []}`). Other empty arrays are a legitimate
/// answer.
pub fn looks_unreadable(content: &str, result_key: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    if UNREADABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return true;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => map
            .get(result_key)
            .and_then(serde_json::Value::as_array)
            .is_some_and(|rows| rows.is_empty()),
        _ => false,
    }
}

/// Build the configured analyzer.
pub fn from_config(
    config: &Config,
    store: Arc<dyn BlobStore>,
    layout: PathLayout,
) -> Result<Arc<dyn Analyzer>> {
    match config.analysis.provider {
        AnalysisProvider::Internal => {
            Ok(Arc::new(InternalApiAnalyzer::from_config(&config.analysis)?))
        }
        AnalysisProvider::OpenAi => {
            let client = Arc::new(OpenAiClient::from_config(&config.analysis)?);
            Ok(Arc::new(OpenAiAnalyzer::new(
                store,
                layout,
                client,
                config.defaults.vision_model.clone(),
            )))
        }
    }
}
