//! HTTP entry points.
//!
//! Serves the synchronous analysis endpoints, the aggregation trigger and
//! the two queue-facing handlers, so an HTTP-push broker can deliver
//! router and process messages straight to this process.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/request-with-file` | Analyze one document |
//! | `POST` | `/chained-request` | Follow up on an earlier response |
//! | `POST` | `/json-to-csv-request` | Invoke the aggregation collaborator |
//! | `POST` | `/queues/router` | Expand a trigger into work items |
//! | `POST` | `/queues/process` | Process one work item |
//! | `GET`  | `/projects/{id}/status` | Finalization state and missing documents |
//! | `POST` | `/projects/{id}/finalize` | Run the completion check now |
//!
//! # Error Contract
//!
//! Every error is `{"error": "<message>"}`. Malformed JSON and invalid input
//! are 400, so a pushing broker dead-letters the message; processing
//! failures are 500, so it redelivers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::models::{AnalysisRequest, TriggerMessage, WorkItem};
use crate::pipeline::Pipeline;

type AppState = Arc<Pipeline>;

/// Bind to `server.bind` and serve until the process exits.
pub async fn run_server(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let bind_addr = pipeline.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "docflow server listening");
    serve(listener, pipeline).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/request-with-file", post(handle_request_with_file))
        .route("/chained-request", post(handle_chained_request))
        .route("/json-to-csv-request", post(handle_json_to_csv))
        .route("/queues/router", post(handle_router_message))
        .route("/queues/process", post(handle_process_message))
        .route("/projects/{id}/status", get(handle_status))
        .route("/projects/{id}/finalize", post(handle_finalize))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(pipeline)
}

// ============ Error response ============

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = if err.is_invalid_input() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        } else {
            tracing::warn!(error = %err, "rejected request");
        }
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

fn parse_body(body: &Bytes) -> Result<Value, AppError> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("malformed JSON body: {}", e)))
}

/// A required, non-blank string field. The first name present wins.
fn required(body: &Value, names: &[&str]) -> Result<String, AppError> {
    names
        .iter()
        .filter_map(|n| body.get(*n).and_then(Value::as_str))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| bad_request(format!("field '{}' is required", names[0])))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ Analysis ============

async fn handle_request_with_file(
    State(pipeline): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body = parse_body(&body)?;
    let request = AnalysisRequest {
        prompt: required(&body, &["prompt"])?,
        model: required(&body, &["model"])?,
        blob_reference: required(&body, &["blob_url", "file_link"])?,
    };
    let response = pipeline.analyzer().analyze(&request).await?;
    Ok(Json(json!(response)))
}

async fn handle_chained_request(
    State(pipeline): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body = parse_body(&body)?;
    let prompt = required(&body, &["prompt"])?;
    let model = required(&body, &["model"])?;
    let previous = required(&body, &["previous_response_id"])?;
    let response = pipeline
        .analyzer()
        .continue_chain(&model, &prompt, &previous)
        .await?;
    Ok(Json(json!(response)))
}

async fn handle_json_to_csv(
    State(pipeline): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let body = parse_body(&body)?;
    let project_id = required(&body, &["project_id"])?;
    pipeline.aggregate(&project_id).await?;
    Ok(Json(json!({ "project_id": project_id, "status": "ok" })))
}

// ============ Queue handlers ============

async fn handle_router_message(
    State(pipeline): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let trigger = TriggerMessage::from_value(parse_body(&body)?)?;
    let summary = pipeline.handle_trigger(&trigger).await?;
    Ok(Json(json!(summary)))
}

async fn handle_process_message(
    State(pipeline): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let value = parse_body(&body)?;
    let item: WorkItem = serde_json::from_value(value)
        .map_err(|e| bad_request(format!("invalid work item: {}", e)))?;
    item.validate()?;
    let result = pipeline.handle_work_item(&item).await?;
    Ok(Json(json!({
        "project_id": item.project_id,
        "document_name": item.display_name(),
        "result_path": result.result_path,
        "parsed_json": result.parsed_json,
    })))
}

// ============ Projects ============

async fn handle_status(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let report = pipeline.status(&id).await?;
    Ok(Json(json!(report)))
}

async fn handle_finalize(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let outcome = pipeline.finalize(&id).await?;
    let mut body = json!({ "project_id": id.trim().trim_matches('/'), "outcome": outcome.as_str() });
    match outcome {
        crate::finalize::FinalizeOutcome::Pending { missing, requeued } => {
            body["missing"] = json!(missing);
            body["requeued"] = json!(requeued);
        }
        crate::finalize::FinalizeOutcome::AggregationFailed(error) => {
            body["error"] = json!(error);
        }
        _ => {}
    }
    Ok(Json(body))
}
