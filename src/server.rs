//! HTTP serving layer.
//!
//! Thin adapter over the ingestion pipeline and chat orchestrator. All
//! error responses share one JSON shape: `{"error": {"code", "message"}}`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::chat::{ChatEvent, ChatOrchestrator};
use crate::error::{IngestError, StoreError};
use crate::ingest::IngestionPipeline;

pub struct AppState {
    pub pipeline: IngestionPipeline,
    pub orchestrator: Arc<ChatOrchestrator>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/clear", post(clear_session))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, bind: &str) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(target: "server", %bind, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}

// ============ Error mapping ============

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match &err {
            IngestError::UnsupportedFormat(_) => AppError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_format",
                err.to_string(),
            ),
            IngestError::Parse(_) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "parse_error", err.to_string())
            }
            IngestError::EmptyDocument => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "empty_document", err.to_string())
            }
            IngestError::IngestFailed(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, "ingest_failed", err.to_string())
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        )
    }
}

// ============ Handlers ============

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct IngestRequest {
    filename: String,
    mime: String,
    content_base64: String,
}

async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.content_base64)
        .map_err(|e| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_base64",
                format!("content_base64: {}", e),
            )
        })?;

    let report = state.pipeline.ingest(&req.filename, &req.mime, &bytes).await?;
    Ok(Json(serde_json::to_value(&report).unwrap_or_default()))
}

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    session_id: Option<String>,
    message: String,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let response = state
        .orchestrator
        .handle(req.session_id, &req.message)
        .await?;
    Ok(Json(serde_json::to_value(&response).unwrap_or_default()))
}

/// Streaming chat: newline-delimited JSON. Each fragment arrives as
/// `{"fragment": "..."}`, then one terminal `{"done": {...}}` carrying the
/// persisted response.
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let rx = Arc::clone(&state.orchestrator)
        .handle_stream(req.session_id, req.message)
        .await;

    let lines = ReceiverStream::new(rx).map(|event| {
        let value = match event {
            ChatEvent::Fragment(text) => json!({ "fragment": text }),
            ChatEvent::Completed(response) => {
                json!({ "done": serde_json::to_value(&response).unwrap_or_default() })
            }
        };
        Ok::<_, std::convert::Infallible>(format!("{}\n", value))
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/x-ndjson")
        .body(Body::from_stream(lines))
        .map_err(|e| {
            AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "stream_error", e.to_string())
        })?;
    Ok(response)
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sessions = state.orchestrator.store().list().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state
        .orchestrator
        .store()
        .load(&id)
        .await?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "session_not_found", id.clone()))?;
    Ok(Json(serde_json::to_value(&session).unwrap_or_default()))
}

async fn clear_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.orchestrator.store().clear(&id).await?;
    Ok(Json(json!({ "cleared": id })))
}
