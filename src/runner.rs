//! Local runner.
//!
//! Runs a whole project inside one process: the trigger goes through an
//! in-memory router queue, work items through an in-memory process queue,
//! and at most `concurrency` items are processed at a time. Items the
//! completion check requeues are picked up in the next round, until the
//! process queue stays empty.
//!
//! Every item of a round is marked in flight in the [`ProcessCache`]
//! before the first one starts, so a sibling's completion check does not
//! requeue documents that are merely still queued behind the semaphore.
//! A failed item is counted and not retried here; after a round with
//! failures one completion check runs, which requeues each failed
//! document once per process.
//!
//! [`ProcessCache`]: crate::finalize::ProcessCache

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::finalize::StatusReport;
use crate::models::{TriggerMessage, WorkItem};
use crate::paths::normalize_stem;
use crate::pipeline::{Components, Pipeline};
use crate::queue::InMemoryQueue;

/// Totals of one local run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub project_id: String,
    pub dispatched: usize,
    pub processed: usize,
    pub failed: Vec<(String, String)>,
    pub rounds: usize,
    pub status: StatusReport,
}

pub struct LocalRunner {
    pipeline: Arc<Pipeline>,
    queue: Arc<InMemoryQueue>,
    concurrency: usize,
}

impl LocalRunner {
    /// Build from configuration, swapping the queue transport for an
    /// in-memory one.
    pub fn from_config(config: Config) -> Result<Self> {
        let mut components = Components::from_config(&config)?;
        let queue = Arc::new(InMemoryQueue::new(config.queue.max_batch_bytes));
        components.transport = queue.clone();
        let concurrency = config.runner.concurrency;
        let pipeline = Arc::new(Pipeline::with_components(config, components)?);
        Ok(Self::new(pipeline, queue, concurrency))
    }

    /// `pipeline` must publish through `queue`.
    pub fn new(pipeline: Arc<Pipeline>, queue: Arc<InMemoryQueue>, concurrency: usize) -> Self {
        Self {
            pipeline,
            queue,
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Project and stem under which the completion check sees this item.
    fn in_flight_key(&self, item: &WorkItem) -> (String, String) {
        let project = self
            .pipeline
            .dispatcher()
            .layout()
            .normalize_project_id(&item.project_id)
            .unwrap_or_else(|_| item.project_id.clone());
        (project, normalize_stem(item.display_name()))
    }

    async fn drain_router(&self) -> Result<usize> {
        let router_queue = self.pipeline.config().queue.router_queue.clone();
        let mut dispatched = 0;
        while let Some(message) = self.queue.pop(&router_queue) {
            let trigger = TriggerMessage::from_json(message.as_bytes())?;
            dispatched += self.pipeline.handle_trigger(&trigger).await?.tasks_sent;
        }
        Ok(dispatched)
    }

    pub async fn run(&self, trigger: &TriggerMessage) -> Result<RunSummary> {
        let project_id = self
            .pipeline
            .dispatcher()
            .layout()
            .normalize_project_id(&trigger.project_id)?;

        self.pipeline.submit_trigger(trigger).await?;
        let dispatched = self.drain_router().await?;

        let process_queue = self.pipeline.config().queue.process_queue.clone();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut processed = 0;
        let mut failed = Vec::new();
        let mut rounds = 0;

        loop {
            let messages = self.queue.take(&process_queue);
            if messages.is_empty() {
                break;
            }
            rounds += 1;
            tracing::info!(project_id = %project_id, round = rounds, items = messages.len(), "processing round");

            let failed_before = failed.len();
            let mut round = Vec::with_capacity(messages.len());
            for message in messages {
                match WorkItem::from_json(message.as_bytes()) {
                    Ok(item) => {
                        let key = self.in_flight_key(&item);
                        self.pipeline.cache().start(&key.0, &key.1);
                        round.push((item, key));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "dropping invalid work item");
                        failed.push(("<invalid>".to_string(), e.to_string()));
                    }
                }
            }

            let mut tasks = JoinSet::new();
            for (item, (item_project, stem)) in round {
                let pipeline = self.pipeline.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let name = item.display_name().to_string();
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => pipeline.handle_work_item(&item).await.map(|_| ()),
                        Err(e) => Err(Error::ExternalService(format!("runner stopped: {}", e))),
                    };
                    pipeline.cache().finish(&item_project, &stem);
                    (name, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => processed += 1,
                    Ok((name, Err(e))) => failed.push((name, e.to_string())),
                    Err(e) => failed.push(("<task>".to_string(), e.to_string())),
                }
            }

            if failed.len() > failed_before {
                match self.pipeline.finalize(&project_id).await {
                    Ok(outcome) => {
                        tracing::info!(project_id = %project_id, outcome = outcome.as_str(), "completion check after failed items")
                    }
                    Err(e) => {
                        tracing::warn!(project_id = %project_id, error = %e, "completion check after failed items failed")
                    }
                }
            }
        }

        let status = self.pipeline.status(&project_id).await?;
        Ok(RunSummary {
            project_id,
            dispatched,
            processed,
            failed,
            rounds,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::config::parse_config;
    use crate::finalize::{Aggregator, FinalizationState};
    use crate::models::{AnalysisRequest, AnalysisResponse, TriggerType};
    use crate::notify::Notifications;
    use crate::storage::{BlobStore, InMemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first call for any blob containing "flaky".
    struct FlakyAnalyzer {
        flaky_calls: AtomicUsize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Analyzer for FlakyAnalyzer {
        async fn analyze(&self, r: &AnalysisRequest) -> Result<AnalysisResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Let siblings run their completion checks while this one is busy.
            tokio::task::yield_now().await;
            if r.blob_reference.contains("flaky")
                && self.flaky_calls.fetch_add(1, Ordering::SeqCst) == 0
            {
                return Err(Error::ExternalService("HTTP 502".into()));
            }
            Ok(AnalysisResponse {
                response_id: "r".into(),
                content: "{\"rows\": [1]}".into(),
            })
        }
        async fn continue_chain(&self, _m: &str, _p: &str, _i: &str) -> Result<AnalysisResponse> {
            Err(Error::ExternalService("unused".into()))
        }
    }

    struct CountingAggregator(AtomicUsize);

    #[async_trait]
    impl Aggregator for CountingAggregator {
        async fn aggregate(&self, _p: &str) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        runner: LocalRunner,
        store: Arc<InMemoryStore>,
        aggregator: Arc<CountingAggregator>,
        analyze_calls: Arc<AtomicUsize>,
    }

    fn runner() -> Fixture {
        let config = parse_config(
            r#"
[storage]
backend = "memory"
base_path = "base"
[defaults]
model = "m"
agent_prompt = "p"
chained_prompt = "c"
[queue]
backend = "memory"
"#,
        )
        .unwrap();
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new(config.queue.max_batch_bytes));
        let aggregator = Arc::new(CountingAggregator(AtomicUsize::new(0)));
        let analyze_calls = Arc::new(AtomicUsize::new(0));
        let components = Components {
            store: store.clone(),
            transport: queue.clone(),
            analyzer: Arc::new(FlakyAnalyzer {
                flaky_calls: AtomicUsize::new(0),
                calls: analyze_calls.clone(),
            }),
            aggregator: aggregator.clone(),
            notifications: Notifications::disabled(),
        };
        let pipeline = Arc::new(Pipeline::with_components(config, components).unwrap());
        Fixture {
            runner: LocalRunner::new(pipeline, queue, 2),
            store,
            aggregator,
            analyze_calls,
        }
    }

    async fn seed(store: &InMemoryStore, names: &[String]) {
        for name in names {
            store
                .put(&format!("base/P1/raw/{}", name), vec![1], "application/pdf")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_processes_project_and_finalizes() {
        let f = runner();
        seed(&f.store, &["a.pdf".into(), "b.pdf".into(), "c.pdf".into()]).await;
        let trigger = TriggerMessage::new("P1", TriggerType::Project).unwrap();
        let summary = f.runner.run(&trigger).await.unwrap();
        assert_eq!(summary.dispatched, 3);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.rounds, 1);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.status.state, FinalizationState::Done);
        assert_eq!(f.aggregator.0.load(Ordering::SeqCst), 1);
        assert_eq!(f.analyze_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_analyzes_each_document_once() {
        let f = runner();
        let names: Vec<String> = (0..10).map(|i| format!("doc{:02}.pdf", i)).collect();
        seed(&f.store, &names).await;
        let runner = f.runner.with_concurrency(4);
        let trigger = TriggerMessage::new("P1", TriggerType::Project).unwrap();
        let summary = runner.run(&trigger).await.unwrap();

        assert_eq!(summary.processed, 10);
        assert_eq!(summary.rounds, 1);
        assert_eq!(f.analyze_calls.load(Ordering::SeqCst), 10);
        assert_eq!(summary.status.state, FinalizationState::Done);
        assert_eq!(f.aggregator.0.load(Ordering::SeqCst), 1);
        assert!(!runner.pipeline().cache().is_in_flight("P1", "doc00"));
    }

    #[tokio::test]
    async fn test_run_recovers_failed_document_through_requeue() {
        let f = runner();
        seed(&f.store, &["a.pdf".into(), "flaky.pdf".into()]).await;
        let runner = f.runner.with_concurrency(1);
        let trigger = TriggerMessage::new("P1", TriggerType::Project).unwrap();
        let summary = runner.run(&trigger).await.unwrap();

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.rounds, 2);
        assert_eq!(summary.processed, 2);
        assert_eq!(f.analyze_calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.status.state, FinalizationState::Done);
        assert!(summary.status.missing.is_empty());
        assert_eq!(f.aggregator.0.load(Ordering::SeqCst), 1);
    }
}
