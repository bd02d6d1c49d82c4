//! Core data models used throughout docflow.
//!
//! These types represent the messages that flow through the pipeline:
//! the inbound [`TriggerMessage`], the per-document [`WorkItem`] the
//! dispatcher produces, and the [`ProcessingResult`] of one document.
//!
//! Wire forms are JSON. Decoding is lenient in the places where older
//! producers are known to differ (a single-string `documents` field, the
//! `file_link` alias for `blob_url`); everything else is strict.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// How a trigger should be expanded into work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// Every blob under the project's raw folder.
    Project,
    /// An explicit list of documents.
    Document,
}

impl TriggerType {
    /// Parse a trimmed, case-insensitive trigger type.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "project" => Ok(Self::Project),
            "document" => Ok(Self::Document),
            "" => Err(Error::Validation("trigger_type is required".into())),
            other => Err(Error::UnsupportedTrigger(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Document => "document",
        }
    }
}

/// Inbound request to expand into per-document work.
///
/// Build one with [`TriggerMessage::from_json`] (queue and HTTP payloads) or
/// [`TriggerMessage::new`] (requeue, CLI). Both enforce the non-blank
/// `project_id` invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMessage {
    pub project_id: String,
    pub trigger_type: TriggerType,
    pub documents: Vec<String>,
    pub model: Option<String>,
    pub agent_prompt: Option<String>,
    pub chained_prompt: Option<String>,
}

/// Raw shape accepted on the wire before validation.
#[derive(Debug, Deserialize)]
struct RawTrigger {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    trigger_type: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    documents: Vec<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    agent_prompt: Option<String>,
    #[serde(default)]
    chained_prompt: Option<String>,
}

fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    let values = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null(()) => Vec::new(),
    };
    Ok(values
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TriggerMessage {
    pub fn new(project_id: impl Into<String>, trigger_type: TriggerType) -> Result<Self> {
        let project_id = project_id.into().trim().to_string();
        if project_id.is_empty() {
            return Err(Error::Validation("project_id is required".into()));
        }
        Ok(Self {
            project_id,
            trigger_type,
            documents: Vec::new(),
            model: None,
            agent_prompt: None,
            chained_prompt: None,
        })
    }

    pub fn with_documents(mut self, documents: Vec<String>) -> Self {
        self.documents = documents;
        self
    }

    /// Decode and validate a JSON trigger payload.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: RawTrigger = serde_json::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("invalid trigger JSON: {}", e)))?;
        Self::from_raw(raw)
    }

    /// Validate an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawTrigger = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("invalid trigger: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawTrigger) -> Result<Self> {
        let trigger_type = TriggerType::parse(raw.trigger_type.as_deref().unwrap_or_default())?;
        let mut trigger = Self::new(raw.project_id.unwrap_or_default(), trigger_type)?;
        if trigger_type == TriggerType::Document && raw.documents.is_empty() {
            return Err(Error::Validation(
                "documents must be a non-empty list when trigger_type is 'document'".into(),
            ));
        }
        trigger.documents = raw.documents;
        trigger.model = non_blank(raw.model);
        trigger.agent_prompt = non_blank(raw.agent_prompt);
        trigger.chained_prompt = non_blank(raw.chained_prompt);
        Ok(trigger)
    }

    /// Canonical JSON form, as accepted by [`TriggerMessage::from_json`].
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "project_id": self.project_id,
            "trigger_type": self.trigger_type.as_str(),
            "documents": self.documents,
        });
        for (key, field) in [
            ("model", &self.model),
            ("agent_prompt", &self.agent_prompt),
            ("chained_prompt", &self.chained_prompt),
        ] {
            if let Some(v) = field {
                value[key] = serde_json::Value::String(v.clone());
            }
        }
        value
    }
}

/// One document's unit of work.
///
/// Created only by the dispatcher, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub project_id: String,
    /// Fully resolved locator of the source document.
    #[serde(rename = "blob_url", alias = "file_link")]
    pub blob_reference: String,
    pub model: String,
    pub agent_prompt: String,
    pub chained_prompt: String,
    #[serde(default)]
    pub document_name: Option<String>,
}

impl WorkItem {
    /// Decode a work item payload and check that every field is present.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let item: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("invalid work item JSON: {}", e)))?;
        item.validate()?;
        Ok(item)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("project_id", &self.project_id),
            ("blob_url", &self.blob_reference),
            ("model", &self.model),
            ("agent_prompt", &self.agent_prompt),
            ("chained_prompt", &self.chained_prompt),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("work item field '{}' is required", name)));
            }
        }
        Ok(())
    }

    /// Serialized wire form.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Name used for logs and notifications: the document name, or the last
    /// segment of the blob reference.
    pub fn display_name(&self) -> &str {
        match self.document_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => self
                .blob_reference
                .rsplit('/')
                .next()
                .unwrap_or(&self.blob_reference),
        }
    }
}

/// Outcome of processing one work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingResult {
    /// Free-form text returned by the analysis collaborator.
    pub initial_response: String,
    pub response_id: String,
    pub parsed_json: serde_json::Value,
    /// Storage path the parsed JSON was written to.
    pub result_path: String,
}

/// Request to the analysis collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub blob_reference: String,
    pub prompt: String,
    pub model: String,
}

/// Response from the analysis collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub response_id: String,
    pub content: String,
}
