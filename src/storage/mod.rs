//! Durable object store abstraction.
//!
//! The [`BlobStore`] trait is the only view of storage the pipeline has.
//! Listings are the source of truth for "what work exists" (raw blobs) and
//! "what work is done" (result blobs), so every backend must return
//! complete, sorted listings.
//!
//! # Backends
//!
//! | Backend | Locator | Use |
//! |---------|---------|-----|
//! | [`InMemoryStore`] | `memory://{container}/{path}` | tests, `docflow run` |
//! | [`LocalStore`] | `file://{root}/{path}` | single-host deployments |
//! | [`S3Store`] | `s3://{bucket}/{key}` | production |
//!
//! # Semantics
//!
//! | Method | Missing blob |
//! |--------|--------------|
//! | [`get`](BlobStore::get) | [`Error::NotFound`] |
//! | [`delete`](BlobStore::delete) | success |
//! | [`exists`](BlobStore::exists) | `false` |

pub mod local;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::{StorageBackendKind, StorageConfig};
use crate::error::{Error, Result};

pub use local::LocalStore;
pub use memory::InMemoryStore;
pub use s3::S3Store;

pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Path-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create or overwrite a blob.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// All blob paths starting with `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Fully resolved reference for a path, as carried in work items.
    fn locator(&self, path: &str) -> String;

    /// Map a reference produced by [`locator`](BlobStore::locator) back to
    /// a path. Returns `Ok(None)` when `reference` is not a locator at all
    /// and an error when it belongs to a different store.
    fn resolve_locator(&self, reference: &str) -> Result<Option<String>>;

    async fn put_text(&self, path: &str, text: &str) -> Result<()> {
        self.put(path, text.as_bytes().to_vec(), CONTENT_TYPE_TEXT)
            .await
    }

    /// Pretty-printed JSON, two-space indent.
    async fn put_json(&self, path: &str, value: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.put(path, bytes, CONTENT_TYPE_JSON).await
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let bytes = self.get(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Resolve a reference that may be a locator or a plain path.
    fn reference_to_path(&self, reference: &str) -> Result<String> {
        match self.resolve_locator(reference)? {
            Some(path) => Ok(path),
            None => Ok(reference.trim().trim_start_matches('/').to_string()),
        }
    }
}

/// Whether `reference` uses a URL scheme.
pub(crate) fn is_locator(reference: &str) -> bool {
    reference
        .split_once("://")
        .map(|(scheme, _)| !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(false)
}

/// Strip `{scheme}://{authority}/` from a locator, failing when the scheme
/// or authority does not match this store.
pub(crate) fn strip_locator(
    reference: &str,
    scheme: &str,
    authority: &str,
) -> Result<Option<String>> {
    let reference = reference.trim();
    if !is_locator(reference) {
        return Ok(None);
    }
    let expected = format!("{}://{}/", scheme, authority.trim_end_matches('/'));
    match reference.strip_prefix(&expected) {
        Some(path) if !path.is_empty() => Ok(Some(path.to_string())),
        _ => Err(Error::InvalidDocument(format!(
            "reference '{}' does not belong to this store (expected prefix '{}')",
            reference, expected
        ))),
    }
}

/// Raw-listing filter built from `storage.exclude_globs`.
#[derive(Clone)]
pub struct ExcludeFilter {
    set: Option<GlobSet>,
}

impl ExcludeFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self { set: None });
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                Error::Configuration(format!("invalid exclude glob '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| Error::Configuration(format!("invalid exclude globs: {}", e)))?;
        Ok(Self { set: Some(set) })
    }

    pub fn none() -> Self {
        Self { set: None }
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.set.as_ref().is_some_and(|set| set.is_match(path))
    }

    /// Drop excluded paths and "directory" placeholders ending in `/`.
    pub fn apply(&self, paths: Vec<String>) -> Vec<String> {
        paths
            .into_iter()
            .filter(|p| !p.ends_with('/') && !self.is_excluded(p))
            .collect()
    }
}

/// Build the configured backend.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    match config.backend {
        StorageBackendKind::Memory => Ok(Arc::new(InMemoryStore::with_container(
            &config.container,
        ))),
        StorageBackendKind::Local => {
            let root = config.root.as_ref().ok_or_else(|| {
                Error::Configuration("storage.root is required for the local backend".into())
            })?;
            Ok(Arc::new(LocalStore::new(root)?))
        }
        StorageBackendKind::S3 => Ok(Arc::new(S3Store::from_config(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_locator() {
        assert!(is_locator("s3://bucket/key"));
        assert!(is_locator("memory://documents/a"));
        assert!(!is_locator("base/P1/raw/a.pdf"));
        assert!(!is_locator("weird name://x"));
    }

    #[test]
    fn test_strip_locator() {
        assert_eq!(
            strip_locator("s3://bucket/base/a.pdf", "s3", "bucket").unwrap(),
            Some("base/a.pdf".to_string())
        );
        assert_eq!(strip_locator("base/a.pdf", "s3", "bucket").unwrap(), None);
        assert!(strip_locator("s3://other/base/a.pdf", "s3", "bucket").is_err());
        assert!(strip_locator("file:///tmp/a", "s3", "bucket").is_err());
    }

    #[test]
    fn test_exclude_filter() {
        let filter = ExcludeFilter::new(&["**/.keep".to_string(), "**/*.tmp".to_string()]).unwrap();
        let kept = filter.apply(vec![
            "base/P1/raw/a.pdf".into(),
            "base/P1/raw/.keep".into(),
            "base/P1/raw/b.tmp".into(),
            "base/P1/raw/sub/".into(),
        ]);
        assert_eq!(kept, vec!["base/P1/raw/a.pdf"]);
    }

    #[test]
    fn test_invalid_glob_is_configuration_error() {
        assert!(matches!(
            ExcludeFilter::new(&["[".to_string()]),
            Err(Error::Configuration(_))
        ));
    }
}
