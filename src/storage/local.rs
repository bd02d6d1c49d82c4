//! Filesystem-backed [`BlobStore`].
//!
//! Blob paths map to files under a root directory. Writes go to a temp file
//! in the same directory and are renamed into place so readers never see a
//! half-written result.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::{Error, Result};

use super::{strip_locator, BlobStore};

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            Error::storage_with_source(format!("cannot create {}", root.display()), e)
        })?;
        let root = root.canonicalize().map_err(|e| {
            Error::storage_with_source(format!("cannot resolve {}", root.display()), e)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, path: &str) -> Result<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|seg| seg == "..") {
            return Err(Error::storage(format!("invalid blob path '{}'", path)));
        }
        Ok(self.root.join(relative))
    }

    fn authority(&self) -> String {
        self.root
            .to_string_lossy()
            .replace('\\', "/")
            .trim_start_matches('/')
            .to_string()
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        let target = self.file_path(path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));

        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::storage_with_source(format!("mkdir {}", parent.display()), e))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::storage_with_source(format!("write {}", tmp.display()), e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage_with_source(
                format!("rename into {}", target.display()),
                e,
            ));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.file_path(path)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => Err(Error::storage_with_source(
                format!("read {}", file.display()),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();

        // Walk only the deepest directory the prefix fully names.
        let start = match prefix.rfind('/') {
            Some(idx) => root.join(&prefix[..idx]),
            None => root.clone(),
        };

        tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            if !start.exists() {
                return Ok(paths);
            }
            for entry in WalkDir::new(&start) {
                let entry = entry.map_err(|e| Error::storage_with_source("walk failed", e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                let rel_str = relative.to_string_lossy().replace('\\', "/");
                let is_temp = entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp");
                if rel_str.starts_with(&prefix) && !is_temp {
                    paths.push(rel_str);
                }
            }
            paths.sort();
            Ok(paths)
        })
        .await
        .map_err(|e| Error::storage(format!("listing task failed: {}", e)))?
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.file_path(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("delete {}", file.display()),
                e,
            )),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let file = self.file_path(path)?;
        Ok(tokio::fs::metadata(&file)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    fn locator(&self, path: &str) -> String {
        format!("file:///{}/{}", self.authority(), path.trim_start_matches('/'))
    }

    fn resolve_locator(&self, reference: &str) -> Result<Option<String>> {
        strip_locator(reference, "file", &format!("/{}", self.authority()))
    }
}
