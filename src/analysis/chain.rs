//! Ordered analysis strategies with fallback.
//!
//! ```text
//! ┌──────────────┐  unreadable / HTTP 500   ┌───────────────┐
//! │  FileUpload  │ ───────────────────────▶ │  PageImages   │ ──▶ ...
//! └──────┬───────┘                          └───────┬───────┘
//!        │ readable                                 │ readable
//!        ▼                                          ▼
//!     response                                   response
//! ```
//!
//! Each strategy reports one of three outcomes: a response, "not
//! applicable" (`Ok(None)`), or an error. The chain decides what happens
//! next:
//!
//! | Outcome | Chain |
//! |---------|-------|
//! | readable response | return it |
//! | unreadable response | remember it, try the next strategy |
//! | not applicable | try the next strategy |
//! | `ExternalService` error carrying HTTP 500 | try the next strategy |
//! | any other error | stop; return the remembered response if any, else the error |
//!
//! When the list is exhausted the last remembered response is returned,
//! even if unreadable; otherwise the last error.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::AnalysisResponse;

use super::looks_unreadable;

/// Everything a strategy needs to analyze one document.
#[derive(Debug, Clone)]
pub struct StrategyInput {
    pub document: Vec<u8>,
    pub filename: String,
    pub prompt: String,
    pub model: String,
}

impl StrategyInput {
    pub fn is_pdf(&self) -> bool {
        self.filename.to_lowercase().ends_with(".pdf") || self.document.starts_with(b"%PDF")
    }
}

#[async_trait]
pub trait AnalysisStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the strategy does not apply to this input.
    async fn attempt(&self, input: &StrategyInput) -> Result<Option<AnalysisResponse>>;
}

/// Whether an error is an upstream HTTP 500.
pub fn is_server_error(err: &Error) -> bool {
    matches!(err, Error::ExternalService(msg) if msg.contains("HTTP 500"))
}

pub struct StrategyChain {
    strategies: Vec<Box<dyn AnalysisStrategy>>,
    /// JSON key whose empty array marks a response as unreadable.
    result_key: String,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Box<dyn AnalysisStrategy>>, result_key: impl Into<String>) -> Self {
        Self {
            strategies,
            result_key: result_key.into(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, input: &StrategyInput) -> Result<AnalysisResponse> {
        let mut remembered: Option<AnalysisResponse> = None;
        let mut last_error: Option<Error> = None;

        for strategy in &self.strategies {
            match strategy.attempt(input).await {
                Ok(Some(response)) => {
                    if !looks_unreadable(&response.content, &self.result_key) {
                        tracing::debug!(strategy = strategy.name(), "strategy succeeded");
                        return Ok(response);
                    }
                    tracing::info!(
                        strategy = strategy.name(),
                        document = %input.filename,
                        "response looks unreadable, falling back"
                    );
                    remembered = Some(response);
                }
                Ok(None) => {
                    tracing::debug!(strategy = strategy.name(), "strategy not applicable");
                }
                Err(e) if is_server_error(&e) => {
                    tracing::warn!(
                        strategy = strategy.name(),
                        document = %input.filename,
                        error = %e,
                        "upstream server error, falling back"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    return match remembered {
                        Some(response) => {
                            tracing::warn!(
                                strategy = strategy.name(),
                                error = %e,
                                "fallback failed, keeping earlier response"
                            );
                            Ok(response)
                        }
                        None => Err(e),
                    };
                }
            }
        }

        match (remembered, last_error) {
            (Some(response), _) => Ok(response),
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::ExternalService(format!(
                "no analysis strategy applies to '{}'",
                input.filename
            ))),
        }
    }
}
