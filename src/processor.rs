//! Document processor.
//!
//! Runs one work item through the per-document state machine:
//!
//! ```text
//! received ─▶ analyzed ─▶ parsed ─▶ persisted ─▶ indexed ─▶ completion-checked
//!                │           │          │            │
//!                └─ error ───┴──────────┘            └─ logged, not fatal
//! ```
//!
//! A failure up to `persisted` notifies and propagates, so the queue
//! transport redelivers the item. Index rebuild and completion check only
//! log their failures: the aggregate is informational and completion is
//! recomputed by every sibling document anyway.
//!
//! Reprocessing the same document overwrites its result at the canonical
//! path, which makes concurrent or redelivered invocations safe.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracing::Instrument;

use crate::aggregate::AggregateIndex;
use crate::analysis::Analyzer;
use crate::error::Result;
use crate::finalize::{Finalizer, ProcessCache, RequeueContext};
use crate::models::{AnalysisRequest, ProcessingResult, WorkItem};
use crate::notify::{Notification, Notifications};
use crate::observability::{document_span, finalize_span};
use crate::parser;
use crate::paths::PathLayout;
use crate::storage::BlobStore;

pub struct DocumentProcessor {
    store: Arc<dyn BlobStore>,
    layout: PathLayout,
    analyzer: Arc<dyn Analyzer>,
    index: AggregateIndex,
    finalizer: Arc<Finalizer>,
    notifications: Notifications,
    cache: Arc<ProcessCache>,
}

impl DocumentProcessor {
    pub fn new(
        store: Arc<dyn BlobStore>,
        layout: PathLayout,
        analyzer: Arc<dyn Analyzer>,
        finalizer: Arc<Finalizer>,
        notifications: Notifications,
        cache: Arc<ProcessCache>,
    ) -> Self {
        Self {
            index: AggregateIndex::new(store.clone(), layout.clone()),
            store,
            layout,
            analyzer,
            finalizer,
            notifications,
            cache,
        }
    }

    pub async fn process(&self, item: &WorkItem) -> Result<ProcessingResult> {
        item.validate()?;
        let project_id = self.layout.normalize_project_id(&item.project_id)?;
        let document = item.display_name().to_string();
        let span = document_span(&project_id, &document);
        self.process_inner(&project_id, &document, item)
            .instrument(span)
            .await
    }

    async fn process_inner(
        &self,
        project_id: &str,
        document: &str,
        item: &WorkItem,
    ) -> Result<ProcessingResult> {
        tracing::info!(blob = %item.blob_reference, model = %item.model, "processing document");
        self.notify_start_once(project_id).await;

        let request = AnalysisRequest {
            blob_reference: item.blob_reference.clone(),
            prompt: item.agent_prompt.clone(),
            model: item.model.clone(),
        };
        let response = match self.analyzer.analyze(&request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(project_id, document, "analysis", e).await),
        };
        tracing::info!(response_id = %response.response_id, chars = response.content.len(), "analysis complete");

        let parsed_json = match parser::parse(&response.content) {
            Ok(value) => value,
            Err(e) => return Err(self.fail(project_id, document, "parse", e).await),
        };

        let result_path = self.layout.result_path(project_id, document);
        if let Err(e) = self.store.put_json(&result_path, &parsed_json).await {
            return Err(self.fail(project_id, document, "persist", e).await);
        }
        tracing::info!(path = %result_path, "persisted result");

        if let Err(e) = self.index.rebuild(project_id).await {
            tracing::warn!(error = %e, "aggregate index rebuild failed");
            self.notifications
                .send(Notification::document_error(
                    project_id,
                    document,
                    &format!("aggregate index rebuild failed: {}", e),
                ))
                .await;
        }

        let context = RequeueContext {
            model: Some(item.model.clone()),
            chained_prompt: Some(item.chained_prompt.clone()),
        };
        match self
            .finalizer
            .maybe_finalize(project_id, &context)
            .instrument(finalize_span(project_id))
            .await
        {
            Ok(outcome) => tracing::info!(outcome = outcome.as_str(), "completion check done"),
            Err(e) => tracing::error!(error = %e, "completion check failed"),
        }

        Ok(ProcessingResult {
            initial_response: response.content,
            response_id: response.response_id,
            parsed_json,
            result_path,
        })
    }

    async fn fail(
        &self,
        project_id: &str,
        document: &str,
        stage: &str,
        error: crate::error::Error,
    ) -> crate::error::Error {
        tracing::error!(stage, error = %error, "document processing failed");
        self.notifications
            .send(Notification::document_error(project_id, document, &error.to_string()))
            .await;
        error
    }

    /// Send the start-of-project notification at most once, gated by the
    /// process cache and then by the info-start marker.
    async fn notify_start_once(&self, project_id: &str) {
        if !self.notifications.is_enabled() || self.cache.is_notified(project_id) {
            return;
        }
        let marker = self.layout.info_start_marker(project_id);
        match self.store.exists(&marker).await {
            Ok(true) => {
                self.cache.mark_notified(project_id);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "could not check start marker");
                return;
            }
        }

        if !self.notifications.send(Notification::start(project_id)).await {
            return;
        }
        let body = json!({
            "status": "sent",
            "timestamp_utc": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        match self.store.put_json(&marker, &body).await {
            Ok(()) => self.cache.mark_notified(project_id),
            Err(e) => tracing::warn!(error = %e, "could not write start marker"),
        }
    }
}
