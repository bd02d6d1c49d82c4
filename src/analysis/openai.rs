//! Direct OpenAI analyzer.
//!
//! Reads the document from the store and runs a [`StrategyChain`]:
//!
//! 1. **file-upload**: upload the document to `POST /files`
//!    (`purpose=assistants`), call `POST /responses` with `input_text` +
//!    `input_file`, delete the uploaded file whatever happens.
//! 2. **page-images**: rasterize every PDF page to PNG through a
//!    [`PageRenderer`] and send the pages as `input_image` data URLs to the
//!    vision model. This is the path for scanned documents.
//! 3. **extracted-text**: extract the PDF text layer with `pdf-extract` and
//!    send it inline to the vision model.
//!
//! Both fallbacks are skipped when no vision model is configured or the
//! document is not a PDF.
//!
//! The final response is archived under `{base}/{project}/processed/` on a
//! best-effort basis.
//!
//! Uploads are retried up to `upload_attempts` times with a linear backoff
//! (`2 s * attempt`, capped at `max_backoff_secs`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use pdfium_render::prelude::{PdfRenderConfig, Pdfium};
use serde_json::{json, Value};

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::models::{AnalysisRequest, AnalysisResponse};
use crate::paths::{basename, PathLayout};
use crate::storage::BlobStore;

use super::chain::{AnalysisStrategy, StrategyChain, StrategyInput};
use super::Analyzer;

// ═══════════════════════════════════════════════════════════════════════
// API client
// ═══════════════════════════════════════════════════════════════════════

pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    upload_attempts: u32,
    backoff: Duration,
    max_backoff: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build OpenAI client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
            upload_attempts: 3,
            backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
        })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::Configuration("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(
            &config.openai_base_url,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )?
        .with_upload_retry(
            config.upload_attempts,
            Duration::from_secs(2),
            Duration::from_secs(config.max_backoff_secs),
        ))
    }

    pub fn with_upload_retry(mut self, attempts: u32, backoff: Duration, max_backoff: Duration) -> Self {
        self.upload_attempts = attempts.max(1);
        self.backoff = backoff;
        self.max_backoff = max_backoff;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(context: &str, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ExternalService(format!(
                "{} returned HTTP {}: {}",
                context,
                status,
                body.chars().take(500).collect::<String>()
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| Error::ExternalService(format!("{} returned invalid JSON: {}", context, e)))
    }

    async fn upload_once(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        let mime = if filename.to_lowercase().ends_with(".pdf") {
            "application/pdf"
        } else {
            "application/octet-stream"
        };
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| Error::ExternalService(format!("invalid upload part: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let resp = self
            .client
            .post(self.url("files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("file upload failed: {}", e)))?;
        let body = Self::check("file upload", resp).await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::ExternalService("file upload response has no id".into()))
    }

    /// Upload with bounded retry. Returns the file id.
    pub async fn upload_file(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        let mut attempt = 1;
        loop {
            match self.upload_once(filename, bytes).await {
                Ok(id) => return Ok(id),
                Err(e) if attempt < self.upload_attempts => {
                    let wait = self.backoff.saturating_mul(attempt).min(self.max_backoff);
                    tracing::warn!(
                        document = filename,
                        attempt,
                        max_attempts = self.upload_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "file upload failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        document = filename,
                        attempts = self.upload_attempts,
                        "file upload failed after all attempts"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Best-effort removal of an uploaded file.
    pub async fn delete_file(&self, file_id: &str) {
        let result = self
            .client
            .delete(self.url(&format!("files/{}", file_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => tracing::warn!(file_id, status = resp.status().as_u16(), "could not delete uploaded file"),
            Err(e) => tracing::warn!(file_id, error = %e, "could not delete uploaded file"),
        }
    }

    /// `POST /responses` with an arbitrary request body.
    pub async fn create_response(&self, body: &Value) -> Result<AnalysisResponse> {
        let resp = self
            .client
            .post(self.url("responses"))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("responses request failed: {}", e)))?;
        let body = Self::check("responses", resp).await?;
        extract_response(&body)
    }
}

/// Response id and the first message text of a responses-API body.
pub fn extract_response(body: &Value) -> Result<AnalysisResponse> {
    let response_id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ExternalService("response has no id".into()))?
        .to_string();

    let from_output = body
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .filter_map(|content| content.first())
        .filter_map(|entry| entry.get("text").and_then(Value::as_str))
        .find(|text| !text.is_empty());

    let content = from_output
        .or_else(|| body.get("output_text").and_then(Value::as_str))
        .ok_or_else(|| Error::ExternalService("response contains no message text".into()))?;

    Ok(AnalysisResponse {
        response_id,
        content: content.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════════════════

pub struct FileUploadStrategy {
    client: Arc<OpenAiClient>,
}

impl FileUploadStrategy {
    pub fn new(client: Arc<OpenAiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnalysisStrategy for FileUploadStrategy {
    fn name(&self) -> &str {
        "file-upload"
    }

    async fn attempt(&self, input: &StrategyInput) -> Result<Option<AnalysisResponse>> {
        let file_id = self.client.upload_file(&input.filename, &input.document).await?;
        let body = json!({
            "model": input.model,
            "input": [{
                "role": "user",
                "content": [
                    {"type": "input_text", "text": input.prompt},
                    {"type": "input_file", "file_id": file_id},
                ],
            }],
        });
        let result = self.client.create_response(&body).await;
        self.client.delete_file(&file_id).await;
        result.map(Some)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Page rendering
// ═══════════════════════════════════════════════════════════════════════

/// Rasterizes PDF pages. Called from a blocking thread.
pub trait PageRenderer: Send + Sync {
    /// One PNG per page, in page order.
    fn render_pages(&self, pdf: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// Renders through the system pdfium library, bound on every call so a
/// missing library only disables the image fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumRenderer;

impl PageRenderer for PdfiumRenderer {
    fn render_pages(&self, pdf: &[u8]) -> Result<Vec<Vec<u8>>> {
        let bindings = Pdfium::bind_to_system_library()
            .map_err(|e| Error::ExternalService(format!("pdfium library unavailable: {:?}", e)))?;
        let pdfium = Pdfium::new(bindings);
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| Error::ExternalService(format!("PDF could not be opened: {:?}", e)))?;
        let config = PdfRenderConfig::new()
            .set_target_width(1600)
            .set_maximum_height(2400);

        let mut pages = Vec::new();
        for (index, page) in document.pages().iter().enumerate() {
            let number = index + 1;
            let bitmap = page
                .render_with_config(&config)
                .map_err(|e| Error::ExternalService(format!("page {} failed to render: {:?}", number, e)))?;
            let rgba = image::RgbaImage::from_raw(
                bitmap.width() as u32,
                bitmap.height() as u32,
                bitmap.as_rgba_bytes(),
            )
            .ok_or_else(|| Error::ExternalService(format!("page {} produced an invalid bitmap", number)))?;

            let mut png = Vec::new();
            image::DynamicImage::ImageRgba8(rgba)
                .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
                .map_err(|e| Error::ExternalService(format!("page {} PNG encoding failed: {}", number, e)))?;
            tracing::debug!(page = number, bytes = png.len(), "rendered page for image fallback");
            pages.push(png);
        }
        Ok(pages)
    }
}

/// `data:image/png;base64,...` URL for one rendered page.
pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64_STANDARD.encode(png))
}

pub struct PageImageStrategy {
    client: Arc<OpenAiClient>,
    vision_model: Option<String>,
    renderer: Arc<dyn PageRenderer>,
}

impl PageImageStrategy {
    pub fn new(
        client: Arc<OpenAiClient>,
        vision_model: Option<String>,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        Self {
            client,
            vision_model: vision_model.filter(|m| !m.trim().is_empty()),
            renderer,
        }
    }
}

#[async_trait]
impl AnalysisStrategy for PageImageStrategy {
    fn name(&self) -> &str {
        "page-images"
    }

    async fn attempt(&self, input: &StrategyInput) -> Result<Option<AnalysisResponse>> {
        let Some(model) = &self.vision_model else {
            tracing::warn!("VISION_MODEL not configured, skipping image fallback");
            return Ok(None);
        };
        if !input.is_pdf() {
            return Ok(None);
        }

        let renderer = self.renderer.clone();
        let document = input.document.clone();
        let rendered = tokio::task::spawn_blocking(move || renderer.render_pages(&document))
            .await
            .map_err(|e| Error::ExternalService(format!("page rendering aborted: {}", e)))?;
        let pages = match rendered {
            Ok(pages) if !pages.is_empty() => pages,
            Ok(_) => {
                tracing::info!(document = %input.filename, "PDF has no pages to render");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(document = %input.filename, error = %e, "could not render pages, skipping image fallback");
                return Ok(None);
            }
        };

        let mut content = vec![json!({"type": "input_text", "text": input.prompt})];
        content.extend(
            pages
                .iter()
                .map(|png| json!({"type": "input_image", "image_url": png_data_url(png)})),
        );
        tracing::info!(document = %input.filename, pages = pages.len(), model = %model, "sending rendered pages");

        let body = json!({
            "model": model,
            "input": [{"role": "user", "content": content}],
        });
        self.client.create_response(&body).await.map(Some)
    }
}

pub struct ExtractedTextStrategy {
    client: Arc<OpenAiClient>,
    vision_model: Option<String>,
}

impl ExtractedTextStrategy {
    pub fn new(client: Arc<OpenAiClient>, vision_model: Option<String>) -> Self {
        Self {
            client,
            vision_model: vision_model.filter(|m| !m.trim().is_empty()),
        }
    }
}

async fn extract_pdf_text(bytes: Vec<u8>) -> Result<String> {
    tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| Error::ExternalService(format!("PDF text extraction aborted: {}", e)))?
        .map_err(|e| Error::ExternalService(format!("PDF text extraction failed: {}", e)))
}

#[async_trait]
impl AnalysisStrategy for ExtractedTextStrategy {
    fn name(&self) -> &str {
        "extracted-text"
    }

    async fn attempt(&self, input: &StrategyInput) -> Result<Option<AnalysisResponse>> {
        let Some(model) = &self.vision_model else {
            tracing::warn!("VISION_MODEL not configured, skipping text fallback");
            return Ok(None);
        };
        if !input.is_pdf() {
            return Ok(None);
        }

        let text = extract_pdf_text(input.document.clone()).await?;
        if text.trim().is_empty() {
            tracing::info!(document = %input.filename, "PDF has no text layer");
            return Ok(None);
        }

        let body = json!({
            "model": model,
            "input": [{
                "role": "user",
                "content": [
                    {"type": "input_text", "text": input.prompt},
                    {"type": "input_text", "text": format!("[Document text: {}]\n{}", input.filename, text)},
                ],
            }],
        });
        self.client.create_response(&body).await.map(Some)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Analyzer
// ═══════════════════════════════════════════════════════════════════════

pub struct OpenAiAnalyzer {
    store: Arc<dyn BlobStore>,
    layout: PathLayout,
    client: Arc<OpenAiClient>,
    chain: StrategyChain,
}

impl OpenAiAnalyzer {
    pub fn new(
        store: Arc<dyn BlobStore>,
        layout: PathLayout,
        client: Arc<OpenAiClient>,
        vision_model: Option<String>,
    ) -> Self {
        Self::with_renderer(store, layout, client, vision_model, Arc::new(PdfiumRenderer))
    }

    pub fn with_renderer(
        store: Arc<dyn BlobStore>,
        layout: PathLayout,
        client: Arc<OpenAiClient>,
        vision_model: Option<String>,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        let chain = StrategyChain::new(
            vec![
                Box::new(FileUploadStrategy::new(client.clone())),
                Box::new(PageImageStrategy::new(client.clone(), vision_model.clone(), renderer)),
                Box::new(ExtractedTextStrategy::new(client.clone(), vision_model)),
            ],
            layout.results_subfolder(),
        );
        Self {
            store,
            layout,
            client,
            chain,
        }
    }

    async fn archive(&self, path: &str, response: &AnalysisResponse) {
        let Some(project_id) = self.layout.project_of(path) else {
            tracing::debug!(path, "no project in path, skipping processed archive");
            return;
        };
        let target = self.layout.processed_path(&project_id, basename(path));
        let payload = json!({
            "response_id": response.response_id,
            "content": response.content,
        });
        match self.store.put_json(&target, &payload).await {
            Ok(()) => tracing::info!(path = %target, "archived model response"),
            Err(e) => tracing::warn!(path = %target, error = %e, "could not archive model response"),
        }
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse> {
        if request.prompt.trim().is_empty() {
            return Err(Error::Validation("prompt is required".into()));
        }
        if request.model.trim().is_empty() {
            return Err(Error::Validation("model is required".into()));
        }

        let path = self.store.reference_to_path(&request.blob_reference)?;
        let document = self.store.get(&path).await?;
        let input = StrategyInput {
            document,
            filename: basename(&path).to_string(),
            prompt: request.prompt.clone(),
            model: request.model.clone(),
        };

        let response = self.chain.run(&input).await?;
        self.archive(&path, &response).await;
        Ok(response)
    }

    async fn continue_chain(
        &self,
        model: &str,
        prompt: &str,
        previous_response_id: &str,
    ) -> Result<AnalysisResponse> {
        let body = json!({
            "model": model,
            "input": prompt,
            "previous_response_id": previous_response_id,
        });
        self.client.create_response(&body).await
    }
}
