//! In-memory [`BlobStore`] for tests and `docflow run`.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock`, so listings come back
//! sorted for free. Write and delete counters let tests assert that an
//! operation performed no storage writes, and path-suffix failure rules
//! let them exercise storage errors on chosen blobs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{strip_locator, BlobStore};

struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
}

pub struct InMemoryStore {
    container: String,
    blobs: RwLock<BTreeMap<String, StoredBlob>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    failing_writes: RwLock<Vec<String>>,
    failing_reads: RwLock<Vec<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_container("documents")
    }

    pub fn with_container(container: &str) -> Self {
        Self {
            container: container.trim_matches('/').to_string(),
            blobs: RwLock::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            failing_writes: RwLock::new(Vec::new()),
            failing_reads: RwLock::new(Vec::new()),
        }
    }

    /// Make every `put` to a path ending in `suffix` fail.
    pub fn fail_writes_to(&self, suffix: &str) {
        if let Ok(mut rules) = self.failing_writes.write() {
            rules.push(suffix.to_string());
        }
    }

    /// Make every `get` of a path ending in `suffix` fail.
    pub fn fail_reads_from(&self, suffix: &str) {
        if let Ok(mut rules) = self.failing_reads.write() {
            rules.push(suffix.to_string());
        }
    }

    /// Drop all failure rules.
    pub fn clear_failures(&self) {
        for rules in [&self.failing_writes, &self.failing_reads] {
            if let Ok(mut rules) = rules.write() {
                rules.clear();
            }
        }
    }

    /// Number of successful `put` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls that removed a blob.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.blobs
            .read()
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Content type recorded for a blob.
    pub fn content_type(&self, path: &str) -> Option<String> {
        self.blobs
            .read()
            .ok()
            .and_then(|blobs| blobs.get(path).map(|b| b.content_type.clone()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::storage("in-memory store lock poisoned")
}

fn check_rules(rules: &RwLock<Vec<String>>, op: &str, path: &str) -> Result<()> {
    let rules = rules.read().map_err(|_| poisoned())?;
    if rules.iter().any(|suffix| path.ends_with(suffix.as_str())) {
        return Err(Error::storage(format!("injected {} failure on {}", op, path)));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for InMemoryStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        check_rules(&self.failing_writes, "write", path)?;
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.insert(
            path.to_string(),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        check_rules(&self.failing_reads, "read", path)?;
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        blobs
            .get(path)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        if blobs.remove(path).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        Ok(blobs.contains_key(path))
    }

    fn locator(&self, path: &str) -> String {
        format!("memory://{}/{}", self.container, path.trim_start_matches('/'))
    }

    fn resolve_locator(&self, reference: &str) -> Result<Option<String>> {
        strip_locator(reference, "memory", &self.container)
    }
}
