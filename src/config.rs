//! Configuration loading.
//!
//! Configuration comes from an optional TOML file overlaid with environment
//! variables. The file is the convenient place for local development; the
//! environment is what deployed workers use. Environment values win.
//!
//! ```toml
//! [storage]
//! backend = "local"
//! root = "./data"
//! base_path = "basedocuments"
//!
//! [defaults]
//! model = "gpt-4.1"
//! agent_prompt_file = "./prompts/agent.txt"
//! chained_prompt = "Return only the JSON document."
//!
//! [queue]
//! backend = "http"
//! endpoint = "http://127.0.0.1:9324"
//! ```
//!
//! [`load_config`] validates the result. A missing required value is an
//! [`Error::Configuration`] and the process must not start serving.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Local,
    S3,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Root directory for the local backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom S3 endpoint (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Container label used in `memory://` locators.
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_raw_folder")]
    pub raw_folder: String,
    #[serde(default = "default_results_folder")]
    pub results_folder: String,
    #[serde(default = "default_results_subfolder")]
    pub results_subfolder: String,
    #[serde(default = "default_aggregate_filename")]
    pub aggregate_filename: String,
    /// Raw blobs matching these globs are not treated as documents.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Local,
            root: None,
            bucket: None,
            region: None,
            endpoint_url: None,
            container: default_container(),
            base_path: default_base_path(),
            raw_folder: default_raw_folder(),
            results_folder: default_results_folder(),
            results_subfolder: default_results_subfolder(),
            aggregate_filename: default_aggregate_filename(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_container() -> String {
    "documents".to_string()
}
fn default_base_path() -> String {
    "basedocuments".to_string()
}
fn default_raw_folder() -> String {
    "raw".to_string()
}
fn default_results_folder() -> String {
    "results".to_string()
}
fn default_results_subfolder() -> String {
    "dispensas".to_string()
}
fn default_aggregate_filename() -> String {
    "dispensas_results".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agent_prompt: Option<String>,
    #[serde(default)]
    pub agent_prompt_file: Option<PathBuf>,
    #[serde(default)]
    pub chained_prompt: Option<String>,
    #[serde(default)]
    pub chained_prompt_file: Option<PathBuf>,
    /// Model used by the extracted-text fallback strategy.
    #[serde(default)]
    pub vision_model: Option<String>,
    /// Append the per-document execution context to agent prompts.
    #[serde(default = "default_true")]
    pub render_context: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: None,
            agent_prompt: None,
            agent_prompt_file: None,
            chained_prompt: None,
            chained_prompt_file: None,
            vision_model: None,
            render_context: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    #[default]
    Http,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackendKind,
    #[serde(default = "default_router_queue")]
    pub router_queue: String,
    #[serde(default = "default_process_queue")]
    pub process_queue: String,
    /// Base URL of the HTTP queue broker.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_queue_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::Http,
            router_queue: default_router_queue(),
            process_queue: default_process_queue(),
            endpoint: None,
            max_batch_bytes: default_max_batch_bytes(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            timeout_secs: default_queue_timeout_secs(),
        }
    }
}

fn default_router_queue() -> String {
    "dispensas-router-in".to_string()
}
fn default_process_queue() -> String {
    "dispensas-process-in".to_string()
}
fn default_max_batch_bytes() -> usize {
    256 * 1024
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    2
}
fn default_queue_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisProvider {
    /// HTTP proxy to the internal `request-with-file` endpoint.
    #[default]
    Internal,
    /// Direct calls to the OpenAI files and responses APIs.
    OpenAi,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub provider: AnalysisProvider,
    #[serde(default = "default_internal_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub upload_attempts: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: AnalysisProvider::Internal,
            base_url: default_internal_base_url(),
            api_key: None,
            openai_base_url: default_openai_base_url(),
            openai_api_key: None,
            timeout_secs: default_analysis_timeout_secs(),
            upload_attempts: default_max_attempts(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_internal_base_url() -> String {
    "http://127.0.0.1:7071/api".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_analysis_timeout_secs() -> u64 {
    120
}
fn default_max_backoff_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregationConfig {
    /// Defaults to `{analysis.base_url}/json_to_csv_request`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_aggregation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_aggregation_timeout_secs(),
        }
    }
}

fn default_aggregation_timeout_secs() -> u64 {
    180
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    /// Notifications are disabled when unset.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_project_tag")]
    pub project_tag: String,
    #[serde(default)]
    pub reference_folder: String,
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            project_tag: default_project_tag(),
            reference_folder: String::new(),
            timeout_secs: default_notification_timeout_secs(),
        }
    }
}

fn default_project_tag() -> String {
    "DOCUMENT_ANALYSIS".to_string()
}
fn default_notification_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7071".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

impl Config {
    /// URL of the downstream aggregation endpoint.
    pub fn aggregation_url(&self) -> String {
        match &self.aggregation.url {
            Some(url) => url.clone(),
            None => format!(
                "{}/json_to_csv_request",
                self.analysis.base_url.trim_end_matches('/')
            ),
        }
    }

    /// Resolved default model. Only meaningful after [`Config::validate`].
    pub fn default_model(&self) -> &str {
        self.defaults.model.as_deref().unwrap_or_default()
    }

    /// Resolved default agent prompt template.
    pub fn default_agent_prompt(&self) -> &str {
        self.defaults.agent_prompt.as_deref().unwrap_or_default()
    }

    /// Resolved default chained prompt.
    pub fn default_chained_prompt(&self) -> &str {
        self.defaults.chained_prompt.as_deref().unwrap_or_default()
    }

    /// Overlay environment values onto the parsed file.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map. Blank
    /// values are ignored so an exported-but-empty variable never erases
    /// a file value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DOCUMENTS_BASE_PATH") {
            self.storage.base_path = v;
        }
        if let Some(v) = get("RAW_DOCUMENTS_FOLDER") {
            self.storage.raw_folder = v;
        }
        if let Some(v) = get("RESULTS_FOLDER") {
            self.storage.results_folder = v;
        }
        if let Some(v) = get("RESULTS_SUBFOLDER") {
            self.storage.results_subfolder = v;
        }
        if let Some(v) = get("AGGREGATE_FILENAME") {
            self.storage.aggregate_filename = v;
        }
        if let Some(v) = get("STORAGE_BACKEND") {
            self.storage.backend = match v.trim().to_lowercase().as_str() {
                "local" => StorageBackendKind::Local,
                "s3" => StorageBackendKind::S3,
                "memory" => StorageBackendKind::Memory,
                other => {
                    return Err(Error::Configuration(format!(
                        "unknown STORAGE_BACKEND '{}': must be local, s3, or memory",
                        other
                    )))
                }
            };
        }
        if let Some(v) = get("STORAGE_ROOT") {
            self.storage.root = Some(PathBuf::from(v));
        }
        if let Some(v) = get("STORAGE_BUCKET") {
            self.storage.bucket = Some(v);
        }
        if let Some(v) = get("AWS_REGION") {
            self.storage.region = Some(v);
        }
        if let Some(v) = get("STORAGE_ENDPOINT_URL") {
            self.storage.endpoint_url = Some(v);
        }

        if let Some(v) = get("DEFAULT_OPENAI_MODEL") {
            self.defaults.model = Some(v);
        }
        if let Some(v) = get("DEFAULT_AGENT_PROMPT") {
            self.defaults.agent_prompt = Some(v);
        }
        if let Some(v) = get("DEFAULT_AGENT_PROMPT_FILE") {
            self.defaults.agent_prompt_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DEFAULT_CHAINED_PROMPT") {
            self.defaults.chained_prompt = Some(v);
        }
        if let Some(v) = get("DEFAULT_CHAINED_PROMPT_FILE") {
            self.defaults.chained_prompt_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("VISION_MODEL") {
            self.defaults.vision_model = Some(v);
        }

        if let Some(v) = get("ROUTER_QUEUE_NAME") {
            self.queue.router_queue = v;
        }
        if let Some(v) = get("PROCESS_QUEUE_NAME") {
            self.queue.process_queue = v;
        }
        if let Some(v) = get("QUEUE_BACKEND") {
            self.queue.backend = match v.trim().to_lowercase().as_str() {
                "http" => QueueBackendKind::Http,
                "memory" => QueueBackendKind::Memory,
                other => {
                    return Err(Error::Configuration(format!(
                        "unknown QUEUE_BACKEND '{}': must be http or memory",
                        other
                    )))
                }
            };
        }
        if let Some(v) = get("QUEUE_ENDPOINT") {
            self.queue.endpoint = Some(v);
        }

        if let Some(v) = get("ANALYSIS_PROVIDER") {
            self.analysis.provider = match v.trim().to_lowercase().as_str() {
                "internal" => AnalysisProvider::Internal,
                "openai" => AnalysisProvider::OpenAi,
                other => {
                    return Err(Error::Configuration(format!(
                        "unknown ANALYSIS_PROVIDER '{}': must be internal or openai",
                        other
                    )))
                }
            };
        }
        if let Some(v) = get("INTERNAL_API_BASE_URL") {
            self.analysis.base_url = v;
        }
        if let Some(v) = get("INTERNAL_API_KEY") {
            self.analysis.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.analysis.openai_api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.analysis.openai_base_url = v;
        }
        if let Some(v) = get("AGGREGATION_URL") {
            self.aggregation.url = Some(v);
        }
        if let Some(v) = get("NOTIFICATIONS_BASE_URL") {
            self.notifications.base_url = Some(v);
        }
        if let Some(v) = get("SERVER_BIND") {
            self.server.bind = v;
        }

        Ok(())
    }

    /// Load prompt files into their inline fields. A file wins over the
    /// inline value.
    pub fn resolve_prompts(&mut self) -> Result<()> {
        if let Some(path) = &self.defaults.agent_prompt_file {
            self.defaults.agent_prompt = Some(load_prompt(path)?);
        }
        if let Some(path) = &self.defaults.chained_prompt_file {
            self.defaults.chained_prompt = Some(load_prompt(path)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let blank = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();

        if blank(&self.defaults.model) {
            return Err(Error::Configuration(
                "defaults.model (DEFAULT_OPENAI_MODEL) must be set".into(),
            ));
        }
        if blank(&self.defaults.agent_prompt) {
            return Err(Error::Configuration(
                "an agent prompt must be set (DEFAULT_AGENT_PROMPT or DEFAULT_AGENT_PROMPT_FILE)"
                    .into(),
            ));
        }
        if blank(&self.defaults.chained_prompt) {
            return Err(Error::Configuration(
                "a chained prompt must be set (DEFAULT_CHAINED_PROMPT or DEFAULT_CHAINED_PROMPT_FILE)"
                    .into(),
            ));
        }

        for (name, value) in [
            ("storage.raw_folder", &self.storage.raw_folder),
            ("storage.results_folder", &self.storage.results_folder),
            ("storage.results_subfolder", &self.storage.results_subfolder),
            ("storage.aggregate_filename", &self.storage.aggregate_filename),
            ("queue.router_queue", &self.queue.router_queue),
            ("queue.process_queue", &self.queue.process_queue),
        ] {
            if value.trim_matches('/').trim().is_empty() {
                return Err(Error::Configuration(format!("{} must not be blank", name)));
            }
        }

        match self.storage.backend {
            StorageBackendKind::Local if self.storage.root.is_none() => {
                return Err(Error::Configuration(
                    "storage.root (STORAGE_ROOT) is required for the local backend".into(),
                ))
            }
            StorageBackendKind::S3 if blank(&self.storage.bucket) || blank(&self.storage.region) => {
                return Err(Error::Configuration(
                    "storage.bucket and storage.region are required for the s3 backend".into(),
                ))
            }
            _ => {}
        }

        if self.queue.backend == QueueBackendKind::Http && blank(&self.queue.endpoint) {
            return Err(Error::Configuration(
                "queue.endpoint (QUEUE_ENDPOINT) is required for the http queue backend".into(),
            ));
        }

        if self.analysis.provider == AnalysisProvider::OpenAi
            && blank(&self.analysis.openai_api_key)
        {
            return Err(Error::Configuration(
                "OPENAI_API_KEY is required when analysis.provider = \"openai\"".into(),
            ));
        }

        if self.queue.max_batch_bytes == 0 {
            return Err(Error::Configuration("queue.max_batch_bytes must be > 0".into()));
        }
        if self.queue.max_attempts == 0 || self.analysis.upload_attempts == 0 {
            return Err(Error::Configuration("retry attempt counts must be >= 1".into()));
        }
        if self.analysis.timeout_secs == 0 || self.aggregation.timeout_secs == 0 {
            return Err(Error::Configuration("timeouts must be > 0".into()));
        }
        if self.runner.concurrency == 0 {
            return Err(Error::Configuration("runner.concurrency must be >= 1".into()));
        }

        Ok(())
    }
}

fn load_prompt(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("cannot read prompt file {}: {}", path.display(), e))
    })?;
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::Configuration(format!(
            "prompt file {} is empty",
            path.display()
        )));
    }
    Ok(content.to_string())
}

/// Parse a TOML document without touching the environment.
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content)
        .map_err(|e| Error::Configuration(format!("failed to parse config file: {}", e)))
}

/// Load, overlay the process environment, resolve prompt files and validate.
///
/// A missing file is not an error: deployed workers are configured purely
/// through the environment.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        parse_config(&content)?
    } else {
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.resolve_prompts()?;
    config.validate()?;
    Ok(config)
}
