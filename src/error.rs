//! Error taxonomy for the dispatch and completion-tracking engine.
//!
//! Every library operation returns [`Result`]. The variants split into
//! three families that callers treat differently:
//!
//! | Family | Variants | Handling |
//! |--------|----------|----------|
//! | Invalid input | `Validation`, `InvalidDocument`, `UnsupportedTrigger`, `NoDocuments` | never retried; HTTP 400; queue handlers re-raise so the transport dead-letters |
//! | Transient | `TransientInfra` | retried locally with bounded backoff, then surfaced |
//! | Everything else | `ExternalService`, `UnparseableResponse`, `Storage`, ... | surfaced; transport redelivery is the retry mechanism |

/// The result type used throughout docflow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by docflow components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A trigger message or work item is malformed or missing a field.
    #[error("validation error: {0}")]
    Validation(String),

    /// A required configuration value is missing or blank.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A project-wide trigger found nothing under the raw folder.
    #[error("no documents found for project '{project_id}' under '{prefix}'")]
    NoDocuments {
        /// Normalized project id.
        project_id: String,
        /// Raw prefix that was listed.
        prefix: String,
    },

    /// A document entry could not be resolved to a raw blob path.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// The trigger type is neither `project` nor `document`.
    #[error("unsupported trigger type '{0}'")]
    UnsupportedTrigger(String),

    /// A single serialized message exceeds the transport batch limit.
    #[error("message of {size} bytes exceeds the {limit} byte batch limit")]
    MessageTooLarge {
        /// Serialized size of the offending message.
        size: usize,
        /// Transport limit.
        limit: usize,
    },

    /// Queue or storage connectivity blip. Safe to retry.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// The analysis, aggregation or notification collaborator failed.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// The result parser exhausted every strategy.
    #[error("unparseable response: {0}")]
    UnparseableResponse(String),

    /// A blob was missing on read.
    #[error("not found: {0}")]
    NotFound(String),

    /// A storage operation failed for a non-transient reason.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Creates a storage error without a source.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage error wrapping its cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether a local retry may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra(_))
    }

    /// Whether the failure is caused by the caller's input.
    #[must_use]
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InvalidDocument(_)
                | Self::UnsupportedTrigger(_)
                | Self::NoDocuments { .. }
        )
    }

    /// Whether the error is a missing-blob error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Maps a `reqwest` failure: connect and timeout errors are transient.
pub(crate) fn classify_http_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() {
        Error::TransientInfra(format!("{}: {}", context, err))
    } else {
        Error::ExternalService(format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_infra_is_transient() {
        assert!(Error::TransientInfra("blip".into()).is_transient());
        assert!(!Error::ExternalService("500".into()).is_transient());
        assert!(!Error::MessageTooLarge { size: 2, limit: 1 }.is_transient());
    }

    #[test]
    fn test_invalid_input_family() {
        assert!(Error::UnsupportedTrigger("batch".into()).is_invalid_input());
        assert!(Error::NoDocuments {
            project_id: "P1".into(),
            prefix: "base/P1/raw/".into()
        }
        .is_invalid_input());
        assert!(!Error::Configuration("model".into()).is_invalid_input());
        assert!(!Error::NotFound("x".into()).is_invalid_input());
    }

    #[test]
    fn test_messages_name_the_offender() {
        let err = Error::MessageTooLarge {
            size: 300_000,
            limit: 262_144,
        };
        assert_eq!(
            err.to_string(),
            "message of 300000 bytes exceeds the 262144 byte batch limit"
        );
    }
}
