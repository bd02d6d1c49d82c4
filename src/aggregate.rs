//! Aggregate index rebuild.
//!
//! The aggregate is regenerated from scratch on every call: list the
//! per-document results, keep one entry per normalized stem, upload the
//! whole array. Since it depends only on the current result blobs it is
//! always safe to rebuild.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::paths::{normalize_stem, PathLayout};
use crate::storage::BlobStore;

/// What a rebuild produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub path: String,
    pub entries: usize,
    /// Results that could not be read or decoded and were left out.
    pub skipped: Vec<String>,
}

pub struct AggregateIndex {
    store: Arc<dyn BlobStore>,
    layout: PathLayout,
}

impl AggregateIndex {
    pub fn new(store: Arc<dyn BlobStore>, layout: PathLayout) -> Self {
        Self { store, layout }
    }

    /// Result paths that feed the index, one per stem.
    ///
    /// The listing is sorted; a later path with the same stem replaces the
    /// earlier one but keeps its position.
    pub async fn sources(&self, project_id: &str) -> Result<Vec<String>> {
        let aggregate = self.layout.aggregate_path(project_id);
        let listed = self
            .store
            .list(&self.layout.results_subfolder_prefix(project_id))
            .await?;

        let mut order: Vec<String> = Vec::new();
        let mut by_stem: HashMap<String, usize> = HashMap::new();
        for path in listed {
            if !path.ends_with(".json") || path == aggregate {
                continue;
            }
            let stem = normalize_stem(&path);
            match by_stem.get(&stem) {
                Some(&idx) => order[idx] = path,
                None => {
                    by_stem.insert(stem, order.len());
                    order.push(path);
                }
            }
        }
        Ok(order)
    }

    pub async fn rebuild(&self, project_id: &str) -> Result<IndexSummary> {
        let sources = self.sources(project_id).await?;
        let mut entries: Vec<Value> = Vec::with_capacity(sources.len());
        let mut skipped = Vec::new();

        for path in sources {
            match self.store.get_json(&path).await {
                Ok(value) => entries.push(value),
                Err(e) => {
                    tracing::warn!(project_id, path = %path, error = %e, "skipping unreadable result");
                    skipped.push(path);
                }
            }
        }

        let target = self.layout.aggregate_path(project_id);
        let count = entries.len();
        self.store.put_json(&target, &Value::Array(entries)).await?;
        tracing::info!(project_id, path = %target, entries = count, "rebuilt aggregate index");

        Ok(IndexSummary {
            path: target,
            entries: count,
            skipped,
        })
    }
}
