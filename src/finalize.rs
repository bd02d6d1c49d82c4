//! Completion detection and the terminal aggregation step.
//!
//! [`Finalizer::maybe_finalize`] is called after every persisted result. It
//! recomputes completion from storage listings each time, never from a
//! counter, so documents may finish in any order and on any instance.
//!
//! ```text
//!            done marker? ──yes──▶ AlreadyDone
//!                 │ no
//!        relocate stray results
//!                 │
//!     raw stems empty? ──yes──▶ NotActionable
//!                 │ no
//!  missing = raw − results ──non-empty──▶ requeue unseen stems ──▶ Pending
//!                 │ empty
//!      lock marker present? ──yes──▶ LockHeld
//!                 │ no
//!         write lock marker
//!                 │
//!            aggregate(project)
//!          ok │          │ err
//!   notify success   notify error
//!   write done       remove lock ──▶ AggregationFailed
//!   remove lock ──▶ Finalized
//! ```
//!
//! # Markers
//!
//! Marker presence is the only persisted state; [`FinalizationState`] is
//! rebuilt from it on every call. The lock is advisory: writing it is not
//! a compare-and-swap, so two instances can race past the check. The done
//! marker is checked first and aggregation is idempotent downstream, so a
//! duplicate run is tolerated.
//!
//! The lock has no expiry. A crash between writing and removing it blocks
//! finalization until someone deletes the marker; [`Finalizer::status`]
//! reports the owner and age to make that visible.
//!
//! # Process cache
//!
//! [`ProcessCache`] remembers which projects were start-notified and which
//! missing stems were already requeued by this process. It also tracks
//! stems a local worker has taken but not finished; those are missing from
//! the result listing only because they are still running, so they are
//! never requeued. It only saves repeated work; markers stay authoritative.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::dispatcher::TaskDispatcher;
use crate::error::{Error, Result};
use crate::models::{TriggerMessage, TriggerType};
use crate::notify::{Notification, Notifications};
use crate::paths::{normalize_stem, PathLayout};
use crate::queue::QueuePublisher;
use crate::storage::BlobStore;

// ============ Aggregation collaborator ============

#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, project_id: &str) -> Result<()>;
}

pub struct HttpAggregator {
    url: String,
    client: reqwest::Client,
}

impl HttpAggregator {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build aggregation client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.aggregation_url(),
            Duration::from_secs(config.aggregation.timeout_secs),
        )
    }
}

#[async_trait]
impl Aggregator for HttpAggregator {
    async fn aggregate(&self, project_id: &str) -> Result<()> {
        tracing::info!(project_id, url = %self.url, "requesting aggregation");
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "project_id": project_id }))
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("aggregation request failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ExternalService(format!(
                "aggregation returned HTTP {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }
        Ok(())
    }
}

// ============ Process cache ============

#[derive(Default)]
struct CacheInner {
    notified: HashSet<String>,
    requeued: HashMap<String, HashSet<String>>,
    in_flight: HashMap<String, HashMap<String, usize>>,
}

/// Per-process memo of start notifications and requeued stems.
#[derive(Default)]
pub struct ProcessCache {
    inner: Mutex<CacheInner>,
}

impl ProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_notified(&self, project_id: &str) -> bool {
        self.lock().notified.contains(project_id)
    }

    pub fn mark_notified(&self, project_id: &str) {
        self.lock().notified.insert(project_id.to_string());
    }

    /// Stems from `stems` neither requeued nor in flight for this project.
    pub fn unrequeued(&self, project_id: &str, stems: &[String]) -> Vec<String> {
        let guard = self.lock();
        let seen = guard.requeued.get(project_id);
        let running = guard.in_flight.get(project_id);
        stems
            .iter()
            .filter(|s| !seen.is_some_and(|set| set.contains(*s)))
            .filter(|s| !running.is_some_and(|map| map.contains_key(*s)))
            .cloned()
            .collect()
    }

    /// Mark a stem as taken by a worker. Calls nest; each needs a matching
    /// [`finish`](Self::finish).
    pub fn start(&self, project_id: &str, stem: &str) {
        *self
            .lock()
            .in_flight
            .entry(project_id.to_string())
            .or_default()
            .entry(stem.to_string())
            .or_insert(0) += 1;
    }

    pub fn finish(&self, project_id: &str, stem: &str) {
        let mut guard = self.lock();
        if let Some(running) = guard.in_flight.get_mut(project_id) {
            if let Some(count) = running.get_mut(stem) {
                *count -= 1;
                if *count == 0 {
                    running.remove(stem);
                }
            }
            if running.is_empty() {
                guard.in_flight.remove(project_id);
            }
        }
    }

    pub fn is_in_flight(&self, project_id: &str, stem: &str) -> bool {
        self.lock()
            .in_flight
            .get(project_id)
            .is_some_and(|running| running.contains_key(stem))
    }

    pub fn record_requeued(&self, project_id: &str, stems: &[String]) {
        self.lock()
            .requeued
            .entry(project_id.to_string())
            .or_default()
            .extend(stems.iter().cloned());
    }

    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.notified.clear();
        guard.requeued.clear();
        guard.in_flight.clear();
    }
}

// ============ State and outcomes ============

/// Finalization state, derived from markers on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FinalizationState {
    NotReady,
    InProgress {
        owner: Option<String>,
        acquired_at: Option<DateTime<Utc>>,
    },
    Done,
}

/// What one [`Finalizer::maybe_finalize`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    AlreadyDone,
    /// No raw documents yet.
    NotActionable,
    Pending {
        missing: Vec<String>,
        requeued: usize,
    },
    /// Another instance holds the lock.
    LockHeld,
    Finalized,
    AggregationFailed(String),
}

impl FinalizeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizeOutcome::AlreadyDone => "already_done",
            FinalizeOutcome::NotActionable => "not_actionable",
            FinalizeOutcome::Pending { .. } => "pending",
            FinalizeOutcome::LockHeld => "lock_held",
            FinalizeOutcome::Finalized => "finalized",
            FinalizeOutcome::AggregationFailed(_) => "aggregation_failed",
        }
    }
}

/// Read-only snapshot of a project's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub project_id: String,
    #[serde(flatten)]
    pub state: FinalizationState,
    pub raw_documents: usize,
    pub results: usize,
    pub missing: Vec<String>,
    /// Seconds since the lock was acquired, when a lock is held.
    pub lock_age_secs: Option<i64>,
}

/// Model and chained prompt inherited by requeued documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequeueContext {
    pub model: Option<String>,
    pub chained_prompt: Option<String>,
}

// ============ Finalizer ============

pub struct Finalizer {
    store: Arc<dyn BlobStore>,
    layout: PathLayout,
    dispatcher: Arc<TaskDispatcher>,
    publisher: QueuePublisher,
    aggregator: Arc<dyn Aggregator>,
    notifications: Notifications,
    cache: Arc<ProcessCache>,
    instance_id: String,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn BlobStore>,
        dispatcher: Arc<TaskDispatcher>,
        publisher: QueuePublisher,
        aggregator: Arc<dyn Aggregator>,
        notifications: Notifications,
        cache: Arc<ProcessCache>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            layout: dispatcher.layout().clone(),
            dispatcher,
            publisher,
            aggregator,
            notifications,
            cache,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn aggregator(&self) -> &Arc<dyn Aggregator> {
        &self.aggregator
    }

    /// Raw stems mapped to their raw path. On a stem collision the last
    /// path in listing order wins.
    async fn raw_stems(&self, project_id: &str) -> Result<BTreeMap<String, String>> {
        let mut stems = BTreeMap::new();
        for path in self.dispatcher.list_raw(project_id).await? {
            stems.insert(normalize_stem(&path), path);
        }
        Ok(stems)
    }

    async fn result_stems(&self, project_id: &str) -> Result<BTreeSet<String>> {
        let aggregate = self.layout.aggregate_path(project_id);
        Ok(self
            .store
            .list(&self.layout.results_subfolder_prefix(project_id))
            .await?
            .into_iter()
            .filter(|p| p.ends_with(".json") && *p != aggregate)
            .map(|p| normalize_stem(&p))
            .collect())
    }

    /// Move per-document results written outside the canonical subfolder
    /// into it. Returns how many were moved. A stray that cannot be moved
    /// is logged and left in place; only a failed listing is an error.
    pub async fn relocate_strays(&self, project_id: &str) -> Result<usize> {
        let mut moved = 0;
        for path in self.store.list(&self.layout.results_prefix(project_id)).await? {
            if !self.layout.is_stray_result(project_id, &path) {
                continue;
            }
            let target = self.layout.canonical_result_for(project_id, &path);
            match self.move_blob(&path, &target).await {
                Ok(()) => {
                    tracing::info!(project_id, from = %path, to = %target, "relocated stray result");
                    moved += 1;
                }
                Err(e) => {
                    tracing::warn!(project_id, from = %path, to = %target, error = %e, "could not relocate stray result");
                }
            }
        }
        Ok(moved)
    }

    async fn move_blob(&self, from: &str, to: &str) -> Result<()> {
        let bytes = self.store.get(from).await?;
        self.store
            .put(to, bytes, crate::storage::CONTENT_TYPE_JSON)
            .await?;
        self.store.delete(from).await
    }

    async fn read_lock(&self, project_id: &str) -> Result<Option<(Option<String>, Option<DateTime<Utc>>)>> {
        let path = self.layout.lock_marker(project_id);
        if !self.store.exists(&path).await? {
            return Ok(None);
        }
        let body = match self.store.get_json(&path).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => {
                tracing::warn!(project_id, error = %e, "lock marker is not readable JSON");
                Value::Null
            }
        };
        let owner = body.get("owner").and_then(Value::as_str).map(str::to_string);
        let acquired_at = body
            .get("acquired_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Some((owner, acquired_at)))
    }

    pub async fn state(&self, project_id: &str) -> Result<FinalizationState> {
        if self.store.exists(&self.layout.done_marker(project_id)).await? {
            return Ok(FinalizationState::Done);
        }
        Ok(match self.read_lock(project_id).await? {
            Some((owner, acquired_at)) => FinalizationState::InProgress { owner, acquired_at },
            None => FinalizationState::NotReady,
        })
    }

    /// Snapshot of the project without writing anything.
    pub async fn status(&self, project_id: &str) -> Result<StatusReport> {
        let project_id = self.layout.normalize_project_id(project_id)?;
        let state = self.state(&project_id).await?;
        let raw = self.raw_stems(&project_id).await?;
        let results = self.result_stems(&project_id).await?;
        let missing: Vec<String> = raw.keys().filter(|s| !results.contains(*s)).cloned().collect();
        let lock_age_secs = match &state {
            FinalizationState::InProgress {
                acquired_at: Some(at),
                ..
            } => Some((Utc::now() - *at).num_seconds()),
            _ => None,
        };
        Ok(StatusReport {
            project_id,
            state,
            raw_documents: raw.len(),
            results: results.len(),
            missing,
            lock_age_secs,
        })
    }

    /// Run the completion check for a project. Safe to call after every
    /// document.
    pub async fn maybe_finalize(
        &self,
        project_id: &str,
        context: &RequeueContext,
    ) -> Result<FinalizeOutcome> {
        let done_marker = self.layout.done_marker(project_id);
        if self.store.exists(&done_marker).await? {
            tracing::debug!(project_id, "project already finalized");
            return Ok(FinalizeOutcome::AlreadyDone);
        }

        self.relocate_strays(project_id).await?;

        let raw = self.raw_stems(project_id).await?;
        if raw.is_empty() {
            tracing::info!(project_id, "no raw documents yet, nothing to finalize");
            return Ok(FinalizeOutcome::NotActionable);
        }
        let results = self.result_stems(project_id).await?;
        let missing: Vec<String> = raw.keys().filter(|s| !results.contains(*s)).cloned().collect();

        if !missing.is_empty() {
            tracing::info!(
                project_id,
                raw = raw.len(),
                results = results.len(),
                missing = missing.len(),
                "project incomplete"
            );
            let requeued = self.requeue(project_id, &missing, &raw, context).await?;
            return Ok(FinalizeOutcome::Pending { missing, requeued });
        }

        let lock_marker = self.layout.lock_marker(project_id);
        if self.store.exists(&lock_marker).await? {
            tracing::info!(project_id, "lock held by another instance");
            return Ok(FinalizeOutcome::LockHeld);
        }
        let lock_body = json!({
            "status": "locked",
            "owner": self.instance_id,
            "acquired_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        self.store.put_json(&lock_marker, &lock_body).await?;
        tracing::info!(project_id, owner = %self.instance_id, "acquired finalization lock");

        match self.aggregator.aggregate(project_id).await {
            Ok(()) => {
                self.notifications
                    .send(Notification::aggregation_success(project_id))
                    .await;
                let done_body = json!({
                    "status": "done",
                    "finished_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                });
                let written = self.store.put_json(&done_marker, &done_body).await;
                self.release_lock(project_id, &lock_marker).await;
                written?;
                tracing::info!(project_id, "project finalized");
                Ok(FinalizeOutcome::Finalized)
            }
            Err(e) => {
                tracing::error!(project_id, error = %e, "aggregation failed");
                self.notifications
                    .send(Notification::aggregation_error(project_id, &e.to_string()))
                    .await;
                self.release_lock(project_id, &lock_marker).await;
                Ok(FinalizeOutcome::AggregationFailed(e.to_string()))
            }
        }
    }

    async fn release_lock(&self, project_id: &str, lock_marker: &str) {
        if let Err(e) = self.store.delete(lock_marker).await {
            tracing::error!(project_id, error = %e, "could not remove finalization lock");
        }
    }

    /// Re-dispatch missing documents not yet requeued by this process.
    async fn requeue(
        &self,
        project_id: &str,
        missing: &[String],
        raw: &BTreeMap<String, String>,
        context: &RequeueContext,
    ) -> Result<usize> {
        let fresh = self.cache.unrequeued(project_id, missing);
        if fresh.is_empty() {
            tracing::debug!(project_id, "missing documents already requeued or in flight");
            return Ok(0);
        }
        let documents: Vec<String> = fresh.iter().filter_map(|s| raw.get(s).cloned()).collect();

        let mut trigger = TriggerMessage::new(project_id, TriggerType::Document)?
            .with_documents(documents);
        trigger.model = context.model.clone();
        trigger.chained_prompt = context.chained_prompt.clone();

        let items = self.dispatcher.generate_tasks(&trigger).await?;
        let sent = self.publisher.send(&items).await?;
        self.cache.record_requeued(project_id, &fresh);
        tracing::info!(project_id, requeued = sent, stems = ?fresh, "requeued missing documents");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::PromptDefaults;
    use crate::models::WorkItem;
    use crate::queue::InMemoryQueue;
    use crate::storage::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAggregator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Aggregator for CountingAggregator {
        async fn aggregate(&self, _project_id: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::ExternalService("aggregation returned HTTP 500: boom".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryQueue>,
        aggregator: Arc<CountingAggregator>,
        cache: Arc<ProcessCache>,
        finalizer: Finalizer,
    }

    fn fixture(fail: bool) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new(1024 * 1024));
        let layout = PathLayout::new("base", "raw", "results", "dispensas", "dispensas_results");
        let dispatcher = Arc::new(TaskDispatcher::new(
            store.clone(),
            layout,
            PromptDefaults {
                model: "gpt-test".into(),
                agent_prompt: "extract".into(),
                chained_prompt: "refine".into(),
                render_context: false,
            },
        ));
        let aggregator = Arc::new(CountingAggregator {
            calls: AtomicUsize::new(0),
            fail,
        });
        let cache = Arc::new(ProcessCache::new());
        let finalizer = Finalizer::new(
            store.clone(),
            dispatcher,
            QueuePublisher::new(queue.clone(), "process"),
            aggregator.clone(),
            Notifications::disabled(),
            cache.clone(),
            "instance-1",
        );
        Fixture {
            store,
            queue,
            aggregator,
            cache,
            finalizer,
        }
    }

    async fn seed(store: &InMemoryStore, raw: &[&str], results: &[&str]) {
        for name in raw {
            store
                .put(&format!("base/P1/raw/{}", name), b"%PDF".to_vec(), "application/pdf")
                .await
                .unwrap();
        }
        for stem in results {
            store
                .put_json(&format!("base/P1/results/dispensas/{}.json", stem), &json!({}))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_document_is_requeued() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf", "b.pdf", "c.pdf"], &["a", "b"]).await;

        let ctx = RequeueContext {
            model: Some("gpt-x".into()),
            chained_prompt: None,
        };
        let outcome = f.finalizer.maybe_finalize("P1", &ctx).await.unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::Pending {
                missing: vec!["c".into()],
                requeued: 1
            }
        );
        let sent = f.queue.take("process");
        assert_eq!(sent.len(), 1);
        let item = WorkItem::from_json(sent[0].as_bytes()).unwrap();
        assert_eq!(item.document_name.as_deref(), Some("c.pdf"));
        assert_eq!(item.model, "gpt-x");
        assert_eq!(item.chained_prompt, "refine");

        assert_eq!(f.aggregator.calls.load(Ordering::SeqCst), 0);
        assert!(!f.store.exists("base/P1/results/csv_generation.done").await.unwrap());
    }

    #[tokio::test]
    async fn test_requeue_dedup_within_process() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf", "b.pdf"], &["a"]).await;
        let ctx = RequeueContext::default();

        f.finalizer.maybe_finalize("P1", &ctx).await.unwrap();
        let second = f.finalizer.maybe_finalize("P1", &ctx).await.unwrap();
        assert_eq!(
            second,
            FinalizeOutcome::Pending {
                missing: vec!["b".into()],
                requeued: 0
            }
        );
        assert_eq!(f.queue.take("process").len(), 1);

        f.cache.reset();
        f.finalizer.maybe_finalize("P1", &ctx).await.unwrap();
        assert_eq!(f.queue.take("process").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_requeue_is_not_recorded() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf", "b.pdf"], &["a"]).await;
        f.queue.fail_next(1, false);

        assert!(f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .is_err());
        assert_eq!(f.cache.unrequeued("P1", &["b".to_string()]), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_complete_project_finalizes_once() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf", "b.pdf", "c.pdf"], &["a", "b", "c"]).await;
        let ctx = RequeueContext::default();

        let outcome = f.finalizer.maybe_finalize("P1", &ctx).await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::Finalized);
        assert_eq!(f.aggregator.calls.load(Ordering::SeqCst), 1);
        assert!(f.store.exists("base/P1/results/csv_generation.done").await.unwrap());
        assert!(!f.store.exists("base/P1/results/.csv_generation.lock").await.unwrap());

        let writes = f.store.write_count();
        let deletes = f.store.delete_count();
        let again = f.finalizer.maybe_finalize("P1", &ctx).await.unwrap();
        assert_eq!(again, FinalizeOutcome::AlreadyDone);
        assert_eq!(f.store.write_count(), writes);
        assert_eq!(f.store.delete_count(), deletes);
        assert_eq!(f.aggregator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_raw_documents_is_not_actionable() {
        let f = fixture(false);
        seed(&f.store, &[], &["a"]).await;
        let outcome = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::NotActionable);
        assert_eq!(f.aggregator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_existing_lock_blocks_finalization() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf"], &["a"]).await;
        f.store
            .put_json(
                "base/P1/results/.csv_generation.lock",
                &json!({"status": "locked", "owner": "other", "acquired_at": "2026-01-01T00:00:00Z"}),
            )
            .await
            .unwrap();

        let outcome = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::LockHeld);
        assert_eq!(f.aggregator.calls.load(Ordering::SeqCst), 0);

        let status = f.finalizer.status("P1").await.unwrap();
        match status.state {
            FinalizationState::InProgress { owner, acquired_at } => {
                assert_eq!(owner.as_deref(), Some("other"));
                assert!(acquired_at.is_some());
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert!(status.lock_age_secs.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_aggregation_failure_releases_lock() {
        let f = fixture(true);
        seed(&f.store, &["a.pdf"], &["a"]).await;
        let outcome = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizeOutcome::AggregationFailed(ref e) if e.contains("500")));
        assert!(!f.store.exists("base/P1/results/.csv_generation.lock").await.unwrap());
        assert!(!f.store.exists("base/P1/results/csv_generation.done").await.unwrap());
        assert_eq!(
            f.finalizer.state("P1").await.unwrap(),
            FinalizationState::NotReady
        );
    }

    #[tokio::test]
    async fn test_stray_results_are_relocated() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf", "b.pdf"], &["a"]).await;
        f.store
            .put_json("base/P1/results/b.json", &json!({"b": true}))
            .await
            .unwrap();

        let outcome = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Finalized);
        assert!(!f.store.exists("base/P1/results/b.json").await.unwrap());
        assert_eq!(
            f.store
                .get_json("base/P1/results/dispensas/b.json")
                .await
                .unwrap(),
            json!({"b": true})
        );
    }

    #[tokio::test]
    async fn test_status_reports_missing_without_writes() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf", "B File.pdf"], &["a"]).await;
        let writes = f.store.write_count();

        let status = f.finalizer.status("/base/P1/raw").await.unwrap();
        assert_eq!(status.project_id, "P1");
        assert_eq!(status.state, FinalizationState::NotReady);
        assert_eq!(status.raw_documents, 2);
        assert_eq!(status.results, 1);
        assert_eq!(status.missing, vec!["b_file".to_string()]);
        assert_eq!(status.lock_age_secs, None);
        assert_eq!(f.store.write_count(), writes);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "not_ready");
    }

    #[tokio::test]
    async fn test_in_flight_stems_are_not_requeued() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf", "b.pdf", "c.pdf"], &["a"]).await;
        f.cache.start("P1", "b");
        f.cache.start("P1", "c");
        f.cache.start("P1", "c");
        f.cache.finish("P1", "c");
        assert!(f.cache.is_in_flight("P1", "c"));

        let outcome = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::Pending {
                missing: vec!["b".into(), "c".into()],
                requeued: 0
            }
        );
        assert!(f.queue.take("process").is_empty());

        // A finished-but-failed stem becomes eligible again.
        f.cache.finish("P1", "b");
        f.cache.finish("P1", "c");
        assert!(!f.cache.is_in_flight("P1", "c"));
        f.finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert_eq!(f.queue.take("process").len(), 2);
    }

    #[tokio::test]
    async fn test_lock_write_failure_aborts_before_aggregation() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf"], &["a"]).await;
        f.store.fail_writes_to(".csv_generation.lock");

        let err = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(f.aggregator.calls.load(Ordering::SeqCst), 0);
        assert!(!f.store.exists("base/P1/results/.csv_generation.lock").await.unwrap());
        assert!(!f.store.exists("base/P1/results/csv_generation.done").await.unwrap());
    }

    #[tokio::test]
    async fn test_done_marker_write_failure_releases_lock() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf"], &["a"]).await;
        f.store.fail_writes_to("csv_generation.done");

        let result = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await;
        assert!(result.is_err());
        assert_eq!(f.aggregator.calls.load(Ordering::SeqCst), 1);
        assert!(!f.store.exists("base/P1/results/.csv_generation.lock").await.unwrap());
        assert_eq!(f.finalizer.state("P1").await.unwrap(), FinalizationState::NotReady);

        // The next check can finish the job.
        f.store.clear_failures();
        let outcome = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Finalized);
    }

    #[tokio::test]
    async fn test_unmovable_stray_does_not_block_completion() {
        let f = fixture(false);
        seed(&f.store, &["a.pdf", "b.pdf"], &["a"]).await;
        f.store
            .put_json("base/P1/results/b.json", &json!({"b": true}))
            .await
            .unwrap();
        f.store
            .put_json("base/P1/results/old.json", &json!({}))
            .await
            .unwrap();
        f.store.fail_reads_from("results/old.json");

        let moved = f.finalizer.relocate_strays("P1").await.unwrap();
        assert_eq!(moved, 1);
        assert!(f.store.exists("base/P1/results/old.json").await.unwrap());
        assert!(f.store.exists("base/P1/results/dispensas/b.json").await.unwrap());

        let outcome = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Finalized);
    }

    #[tokio::test]
    async fn test_raw_stem_collision_requeues_last_listed_path() {
        let f = fixture(false);
        seed(&f.store, &["Invoice.pdf", "invoice.pdf", "z.pdf"], &["z"]).await;

        let outcome = f
            .finalizer
            .maybe_finalize("P1", &RequeueContext::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::Pending {
                missing: vec!["invoice".into()],
                requeued: 1
            }
        );
        let sent = f.queue.take("process");
        let item = WorkItem::from_json(sent[0].as_bytes()).unwrap();
        assert_eq!(item.document_name.as_deref(), Some("invoice.pdf"));
    }
}
