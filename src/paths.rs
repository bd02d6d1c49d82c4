//! Blob path conventions.
//!
//! All paths are `/`-joined and live under a project root:
//!
//! ```text
//! {base}/{project}/
//! ├── {raw}/{filename}                          raw input
//! ├── {results}/
//! │   ├── {subfolder}/{stem}.json               per-document result
//! │   ├── {aggregate}.json                      aggregate index
//! │   ├── .csv_generation.lock                  lock marker
//! │   ├── csv_generation.done                   done marker
//! │   └── .info_start.sent                      start-notified marker
//! └── processed/{stem}.json                     archived model responses
//! ```
//!
//! A document and its result are matched by [`normalize_stem`]. The mapping
//! must stay stable: reprocessing a document overwrites its result instead
//! of creating a sibling.

use crate::config::StorageConfig;
use crate::error::{Error, Result};

pub const LOCK_MARKER: &str = ".csv_generation.lock";
pub const DONE_MARKER: &str = "csv_generation.done";
pub const INFO_START_MARKER: &str = ".info_start.sent";
const PROCESSED_FOLDER: &str = "processed";

/// Last `/`-separated segment of a path.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Document basename without its extension, trimmed, lower-cased, with
/// whitespace replaced by `_`.
///
/// `"Invoice 01.PDF"` and `"invoice_01.pdf"` both map to `invoice_01`.
pub fn normalize_stem(name: &str) -> String {
    let base = basename(name.trim());
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };
    let normalized: String = stem
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if normalized.is_empty() {
        "result".to_string()
    } else {
        normalized
    }
}

fn clean_segment(value: &str) -> String {
    value.trim().trim_matches('/').to_string()
}

/// Path layout for every project, derived from the storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    base: String,
    raw_folder: String,
    results_folder: String,
    results_subfolder: String,
    aggregate_filename: String,
}

impl PathLayout {
    pub fn new(
        base: &str,
        raw_folder: &str,
        results_folder: &str,
        results_subfolder: &str,
        aggregate_filename: &str,
    ) -> Self {
        let aggregate = clean_segment(aggregate_filename);
        let aggregate = aggregate
            .strip_suffix(".json")
            .map(str::to_string)
            .unwrap_or(aggregate);
        Self {
            base: clean_segment(base),
            raw_folder: clean_segment(raw_folder),
            results_folder: clean_segment(results_folder),
            results_subfolder: clean_segment(results_subfolder),
            aggregate_filename: aggregate,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            &config.base_path,
            &config.raw_folder,
            &config.results_folder,
            &config.results_subfolder,
            &config.aggregate_filename,
        )
    }

    pub fn raw_folder(&self) -> &str {
        &self.raw_folder
    }

    /// Name of the per-document results folder; also the key analysis
    /// responses carry their rows under.
    pub fn results_subfolder(&self) -> &str {
        &self.results_subfolder
    }

    pub fn project_root(&self, project_id: &str) -> String {
        if self.base.is_empty() {
            project_id.to_string()
        } else {
            format!("{}/{}", self.base, project_id)
        }
    }

    pub fn raw_prefix(&self, project_id: &str) -> String {
        format!("{}/{}/", self.project_root(project_id), self.raw_folder)
    }

    pub fn results_prefix(&self, project_id: &str) -> String {
        format!("{}/{}/", self.project_root(project_id), self.results_folder)
    }

    pub fn results_subfolder_prefix(&self, project_id: &str) -> String {
        format!(
            "{}{}/",
            self.results_prefix(project_id),
            self.results_subfolder
        )
    }

    /// Canonical result path for a document.
    pub fn result_path(&self, project_id: &str, document: &str) -> String {
        format!(
            "{}{}.json",
            self.results_subfolder_prefix(project_id),
            normalize_stem(document)
        )
    }

    pub fn aggregate_path(&self, project_id: &str) -> String {
        format!(
            "{}{}.json",
            self.results_prefix(project_id),
            self.aggregate_filename
        )
    }

    pub fn lock_marker(&self, project_id: &str) -> String {
        format!("{}{}", self.results_prefix(project_id), LOCK_MARKER)
    }

    pub fn done_marker(&self, project_id: &str) -> String {
        format!("{}{}", self.results_prefix(project_id), DONE_MARKER)
    }

    pub fn info_start_marker(&self, project_id: &str) -> String {
        format!("{}{}", self.results_prefix(project_id), INFO_START_MARKER)
    }

    pub fn processed_path(&self, project_id: &str, document: &str) -> String {
        format!(
            "{}/{}/{}.json",
            self.project_root(project_id),
            PROCESSED_FOLDER,
            normalize_stem(document)
        )
    }

    /// Project id with surrounding slashes, a leading `{base}/` and a
    /// trailing `/{raw}` removed.
    pub fn normalize_project_id(&self, raw: &str) -> Result<String> {
        let mut id = raw.trim().trim_matches('/');
        if !self.base.is_empty() {
            if let Some(rest) = id.strip_prefix(self.base.as_str()) {
                if let Some(rest) = rest.strip_prefix('/') {
                    id = rest;
                }
            }
        }
        if let Some(rest) = id.strip_suffix(self.raw_folder.as_str()) {
            if let Some(rest) = rest.strip_suffix('/') {
                id = rest;
            }
        }
        let id = id.trim_matches('/').trim();
        if id.is_empty() {
            return Err(Error::Validation(format!(
                "project_id '{}' is blank after normalization",
                raw
            )));
        }
        Ok(id.to_string())
    }

    /// Resolve a document entry to its full raw blob path.
    ///
    /// Accepts fully qualified paths, paths missing the base or project
    /// segment, paths relative to the raw folder, and bare filenames. A
    /// fully qualified path resolves to itself.
    pub fn resolve_document(&self, project_id: &str, entry: &str) -> Result<String> {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidDocument(format!(
                "blank document entry for project '{}'",
                project_id
            )));
        }

        let normalized = trimmed.replace('\\', "/");
        let mut rest = normalized.trim_start_matches('/');
        for segment in [self.base.as_str(), project_id, self.raw_folder.as_str()] {
            if segment.is_empty() {
                continue;
            }
            if let Some(stripped) = rest.strip_prefix(segment) {
                if let Some(stripped) = stripped.strip_prefix('/') {
                    rest = stripped;
                }
            }
        }

        let rest = rest.trim_matches('/');
        if rest.is_empty() {
            return Err(Error::InvalidDocument(format!(
                "document entry '{}' names a folder, not a document",
                entry
            )));
        }
        Ok(format!("{}{}", self.raw_prefix(project_id), rest))
    }

    /// Project id of a blob path under this layout, if it has one.
    pub fn project_of(&self, path: &str) -> Option<String> {
        let mut rest = path.trim_start_matches('/');
        if !self.base.is_empty() {
            rest = rest.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        }
        let mut segments = rest.split('/');
        let project = segments.next().filter(|p| !p.is_empty())?;
        // Needs at least a folder and a file below the project.
        if segments.count() < 2 {
            return None;
        }
        Some(project.to_string())
    }

    /// Whether `path` is a per-document result written outside the
    /// canonical subfolder.
    pub fn is_stray_result(&self, project_id: &str, path: &str) -> bool {
        let results_prefix = self.results_prefix(project_id);
        path.starts_with(&results_prefix)
            && path.ends_with(".json")
            && path != self.aggregate_path(project_id)
            && !path.starts_with(&self.results_subfolder_prefix(project_id))
    }

    /// Canonical destination for a stray result.
    pub fn canonical_result_for(&self, project_id: &str, stray_path: &str) -> String {
        format!(
            "{}{}",
            self.results_subfolder_prefix(project_id),
            basename(stray_path)
        )
    }
}
