//! Component wiring.
//!
//! [`Pipeline`] owns one instance of every component, built from a
//! [`Config`], and exposes the queue-message handlers shared by the HTTP
//! server, the CLI and the local runner.
//!
//! ```text
//! router queue ──▶ handle_trigger ──▶ TaskDispatcher ──▶ QueuePublisher ──▶ process queue
//! process queue ──▶ handle_work_item ──▶ DocumentProcessor ──▶ Finalizer
//! ```

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::analysis::{self, Analyzer};
use crate::config::{Config, QueueBackendKind};
use crate::dispatcher::{PromptDefaults, TaskDispatcher};
use crate::error::Result;
use crate::finalize::{
    Aggregator, FinalizeOutcome, Finalizer, HttpAggregator, ProcessCache, RequeueContext,
    StatusReport,
};
use crate::models::{ProcessingResult, TriggerMessage, WorkItem};
use crate::notify::Notifications;
use crate::observability::finalize_span;
use crate::paths::PathLayout;
use crate::processor::DocumentProcessor;
use crate::queue::{HttpQueue, InMemoryQueue, QueuePublisher, QueueTransport};
use crate::storage::{self, BlobStore, ExcludeFilter};

use tracing::Instrument;

/// The external collaborators a pipeline talks to.
#[derive(Clone)]
pub struct Components {
    pub store: Arc<dyn BlobStore>,
    pub transport: Arc<dyn QueueTransport>,
    pub analyzer: Arc<dyn Analyzer>,
    pub aggregator: Arc<dyn Aggregator>,
    pub notifications: Notifications,
}

impl Components {
    /// Build every collaborator from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = storage::from_config(&config.storage)?;
        let transport: Arc<dyn QueueTransport> = match config.queue.backend {
            QueueBackendKind::Http => Arc::new(HttpQueue::from_config(&config.queue)?),
            QueueBackendKind::Memory => Arc::new(InMemoryQueue::new(config.queue.max_batch_bytes)),
        };
        let analyzer = analysis::from_config(
            config,
            store.clone(),
            PathLayout::from_config(&config.storage),
        )?;
        let aggregator = Arc::new(HttpAggregator::from_config(config)?);
        let notifications = Notifications::from_config(&config.notifications)?;
        Ok(Self {
            store,
            transport,
            analyzer,
            aggregator,
            notifications,
        })
    }
}

/// What a trigger produced.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DispatchSummary {
    pub project_id: String,
    pub tasks_sent: usize,
}

pub struct Pipeline {
    config: Config,
    components: Components,
    dispatcher: Arc<TaskDispatcher>,
    router: QueuePublisher,
    publisher: QueuePublisher,
    finalizer: Arc<Finalizer>,
    processor: DocumentProcessor,
    cache: Arc<ProcessCache>,
}

impl Pipeline {
    pub fn from_config(config: Config) -> Result<Self> {
        let components = Components::from_config(&config)?;
        Self::with_components(config, components)
    }

    pub fn with_components(config: Config, components: Components) -> Result<Self> {
        let layout = PathLayout::from_config(&config.storage);
        let exclude = ExcludeFilter::new(&config.storage.exclude_globs)?;
        let dispatcher = Arc::new(
            TaskDispatcher::new(
                components.store.clone(),
                layout.clone(),
                PromptDefaults::from_config(&config),
            )
            .with_exclude(exclude),
        );

        let backoff = Duration::from_secs(config.queue.backoff_secs);
        let router = QueuePublisher::new(components.transport.clone(), &config.queue.router_queue)
            .with_retry(config.queue.max_attempts, backoff);
        let publisher =
            QueuePublisher::new(components.transport.clone(), &config.queue.process_queue)
                .with_retry(config.queue.max_attempts, backoff);

        let cache = Arc::new(ProcessCache::new());
        let instance_id = Uuid::new_v4().to_string();
        let finalizer = Arc::new(Finalizer::new(
            components.store.clone(),
            dispatcher.clone(),
            publisher.clone(),
            components.aggregator.clone(),
            components.notifications.clone(),
            cache.clone(),
            instance_id,
        ));
        let processor = DocumentProcessor::new(
            components.store.clone(),
            layout,
            components.analyzer.clone(),
            finalizer.clone(),
            components.notifications.clone(),
            cache.clone(),
        );

        tracing::debug!(instance_id = finalizer.instance_id(), "pipeline ready");
        Ok(Self {
            config,
            components,
            dispatcher,
            router,
            publisher,
            finalizer,
            processor,
            cache,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.components.store
    }

    pub fn analyzer(&self) -> &Arc<dyn Analyzer> {
        &self.components.analyzer
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    pub fn cache(&self) -> &ProcessCache {
        &self.cache
    }

    /// Put a trigger on the router queue.
    pub async fn submit_trigger(&self, trigger: &TriggerMessage) -> Result<usize> {
        self.router.send(&[trigger.to_json()]).await
    }

    /// Expand a trigger without publishing anything.
    pub async fn plan(&self, trigger: &TriggerMessage) -> Result<Vec<WorkItem>> {
        self.dispatcher.generate_tasks(trigger).await
    }

    /// Router-queue handler: expand the trigger and publish its work items.
    pub async fn handle_trigger(&self, trigger: &TriggerMessage) -> Result<DispatchSummary> {
        let items = self.dispatcher.generate_tasks(trigger).await?;
        let project_id = items
            .first()
            .map(|i| i.project_id.clone())
            .unwrap_or_else(|| trigger.project_id.clone());
        let tasks_sent = self.publisher.send(&items).await?;
        tracing::info!(project_id = %project_id, tasks_sent, queue = self.publisher.queue(), "trigger dispatched");
        Ok(DispatchSummary {
            project_id,
            tasks_sent,
        })
    }

    /// Process-queue handler.
    pub async fn handle_work_item(&self, item: &WorkItem) -> Result<ProcessingResult> {
        self.processor.process(item).await
    }

    fn default_context(&self) -> RequeueContext {
        RequeueContext {
            model: Some(self.config.default_model().to_string()).filter(|m| !m.is_empty()),
            chained_prompt: Some(self.config.default_chained_prompt().to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    /// Run the completion check on demand with the default model and
    /// chained prompt.
    pub async fn finalize(&self, project_id: &str) -> Result<FinalizeOutcome> {
        let project_id = self.dispatcher.layout().normalize_project_id(project_id)?;
        self.finalizer
            .maybe_finalize(&project_id, &self.default_context())
            .instrument(finalize_span(&project_id))
            .await
    }

    pub async fn status(&self, project_id: &str) -> Result<StatusReport> {
        self.finalizer.status(project_id).await
    }

    /// Invoke the aggregation collaborator directly.
    pub async fn aggregate(&self, project_id: &str) -> Result<()> {
        let project_id = self.dispatcher.layout().normalize_project_id(project_id)?;
        self.components.aggregator.aggregate(&project_id).await
    }
}
