//! Task dispatcher.
//!
//! Expands a [`TriggerMessage`] into one [`WorkItem`] per raw document.
//!
//! ```text
//! trigger{project}  ──list {base}/{project}/{raw}/──┐
//!                                                   ├──▶ [WorkItem, ...]
//! trigger{document} ──resolve each entry───────────┘
//! ```
//!
//! Dispatch only reads storage, so it is safe to retry.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{TriggerMessage, TriggerType, WorkItem};
use crate::paths::{basename, PathLayout};
use crate::storage::{is_locator, BlobStore, ExcludeFilter};

/// Slot an agent prompt template may use for the execution context. When
/// absent the context is appended.
pub const CONTEXT_SLOT: &str = "{{execution_context}}";

/// Process-wide fallbacks for values a trigger may override.
#[derive(Debug, Clone)]
pub struct PromptDefaults {
    pub model: String,
    pub agent_prompt: String,
    pub chained_prompt: String,
    /// Render the execution context into each agent prompt.
    pub render_context: bool,
}

impl PromptDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.default_model().to_string(),
            agent_prompt: config.default_agent_prompt().to_string(),
            chained_prompt: config.default_chained_prompt().to_string(),
            render_context: config.defaults.render_context,
        }
    }
}

/// Per-document context injected into the agent prompt.
pub fn render_agent_prompt(
    template: &str,
    project_id: &str,
    extracted_at: &DateTime<Utc>,
    document_name: &str,
) -> String {
    let block = format!(
        "[Execution context]\n- Project: {}\n- Extraction date (UTC): {}\n- Processed file: {}\n",
        project_id,
        extracted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        document_name
    );
    if template.contains(CONTEXT_SLOT) {
        template.replace(CONTEXT_SLOT, &block)
    } else {
        format!("{}\n\n{}", template.trim_end(), block)
    }
}

fn pick(override_value: Option<&str>, default: &str, name: &str) -> Result<String> {
    let value = override_value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.trim());
    if value.is_empty() {
        return Err(Error::Configuration(format!(
            "no {} in the trigger and no default configured",
            name
        )));
    }
    Ok(value.to_string())
}

pub struct TaskDispatcher {
    store: Arc<dyn BlobStore>,
    layout: PathLayout,
    defaults: PromptDefaults,
    exclude: ExcludeFilter,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn BlobStore>, layout: PathLayout, defaults: PromptDefaults) -> Self {
        Self {
            store,
            layout,
            defaults,
            exclude: ExcludeFilter::none(),
        }
    }

    pub fn with_exclude(mut self, exclude: ExcludeFilter) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn layout(&self) -> &PathLayout {
        &self.layout
    }

    pub fn defaults(&self) -> &PromptDefaults {
        &self.defaults
    }

    /// Raw document paths for a project, sorted, with exclusions applied.
    pub async fn list_raw(&self, project_id: &str) -> Result<Vec<String>> {
        let prefix = self.layout.raw_prefix(project_id);
        let paths = self.store.list(&prefix).await?;
        Ok(self.exclude.apply(paths))
    }

    pub async fn generate_tasks(&self, trigger: &TriggerMessage) -> Result<Vec<WorkItem>> {
        self.generate_tasks_at(trigger, Utc::now()).await
    }

    /// [`generate_tasks`](Self::generate_tasks) with a fixed extraction
    /// timestamp shared by every item of the batch.
    pub async fn generate_tasks_at(
        &self,
        trigger: &TriggerMessage,
        extracted_at: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let model = pick(trigger.model.as_deref(), &self.defaults.model, "model")?;
        let template = pick(
            trigger.agent_prompt.as_deref(),
            &self.defaults.agent_prompt,
            "agent prompt",
        )?;
        let chained_prompt = pick(
            trigger.chained_prompt.as_deref(),
            &self.defaults.chained_prompt,
            "chained prompt",
        )?;
        let project_id = self.layout.normalize_project_id(&trigger.project_id)?;

        let raw_paths = match trigger.trigger_type {
            TriggerType::Project => {
                let paths = self.list_raw(&project_id).await?;
                if paths.is_empty() {
                    return Err(Error::NoDocuments {
                        prefix: self.layout.raw_prefix(&project_id),
                        project_id,
                    });
                }
                paths
            }
            TriggerType::Document => {
                if trigger.documents.is_empty() {
                    return Err(Error::Validation(
                        "documents must be a non-empty list when trigger_type is 'document'"
                            .into(),
                    ));
                }
                trigger
                    .documents
                    .iter()
                    .map(|entry| self.resolve_entry(&project_id, entry))
                    .collect::<Result<Vec<_>>>()?
            }
        };

        let items: Vec<WorkItem> = raw_paths
            .iter()
            .map(|path| {
                let document_name = basename(path).to_string();
                let agent_prompt = if self.defaults.render_context {
                    render_agent_prompt(&template, &project_id, &extracted_at, &document_name)
                } else {
                    template.clone()
                };
                tracing::debug!(project_id = %project_id, path = %path, "generated work item");
                WorkItem {
                    project_id: project_id.clone(),
                    blob_reference: self.store.locator(path),
                    model: model.clone(),
                    agent_prompt,
                    chained_prompt: chained_prompt.clone(),
                    document_name: Some(document_name),
                }
            })
            .collect();

        tracing::info!(
            project_id = %project_id,
            trigger_type = trigger.trigger_type.as_str(),
            count = items.len(),
            "generated work items"
        );
        Ok(items)
    }

    /// Resolve one `documents` entry, accepting store locators.
    fn resolve_entry(&self, project_id: &str, entry: &str) -> Result<String> {
        if is_locator(entry.trim()) {
            let path = self
                .store
                .resolve_locator(entry)?
                .ok_or_else(|| Error::InvalidDocument(format!("unresolvable reference '{}'", entry)))?;
            if !path.starts_with(&self.layout.raw_prefix(project_id)) {
                return Err(Error::InvalidDocument(format!(
                    "reference '{}' is outside the raw folder of project '{}'",
                    entry, project_id
                )));
            }
            return Ok(path);
        }
        self.layout.resolve_document(project_id, entry)
    }
}
