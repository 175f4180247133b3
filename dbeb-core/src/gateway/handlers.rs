//! Route handlers. Streaming routes parse and validate the request, then
//! hand off to a producer in `workflows`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::server::{index_document, AppState};
use super::sse::{stream_frames, Frame};
use super::uploads::{SavedFile, UploadForm};
use super::workflows;
use crate::documents::{self, DocumentKind};
use crate::error::EvaluationError;
use crate::evaluator::{EvaluationInputs, EvaluationReport};
use crate::splitter::TextSplitter;

pub(crate) async fn index() -> Json<Value> {
    Json(index_document())
}

pub(crate) async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// The single uploaded PDF of an upload route.
fn require_pdf(form: &UploadForm) -> Result<&SavedFile, ApiError> {
    let file = form.files().first().ok_or_else(|| ApiError::missing_field("file"))?;
    if DocumentKind::from_path(&file.path) != Some(DocumentKind::Pdf) {
        return Err(ApiError::bad_request("Only PDF files are supported"));
    }
    Ok(file)
}

/// `POST /agent`: classify the request, then stream the matching workflow.
pub(crate) async fn agent(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = UploadForm::from_multipart(multipart).await?;
    let message = form
        .field("message")
        .ok_or_else(|| ApiError::missing_field("message"))?
        .to_string();
    let thread_id = form
        .field("thread_id")
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let intent = state.router.route(&message, &form.file_names()).await;
    info!(
        thread_id = %thread_id,
        intent = %intent.intent,
        confidence = intent.confidence,
        files = form.files().len(),
        "Agent request routed"
    );

    Ok(stream_frames(move |sink| {
        workflows::agent_request(state, form, message, thread_id, intent, sink)
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct StreamRequest {
    pub thread_id: Option<String>,
    pub text: Option<String>,
    pub context: Option<String>,
}

/// `POST /stream`: legacy chat stream with `sse-error` failures.
pub(crate) async fn stream(
    State(state): State<AppState>,
    body: Result<Json<StreamRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection.into_response(),
    };
    let Some(text) = body.text.filter(|t| !t.trim().is_empty()) else {
        return stream_frames(|sink| async move {
            sink.emit(Frame::new("sse-error", "Missing 'text' field")).await;
        });
    };
    let thread_id = body
        .thread_id
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let message = workflows::compose_message(&text, body.context.as_deref());

    stream_frames(move |sink| async move {
        workflows::chat(&state, &sink, &thread_id, &message, "sse-error").await;
    })
}

/// `POST /upload`: admin-only PDF ingestion into the global collection.
pub(crate) async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    if !state.auth.validate_headers(&headers) {
        warn!("Rejected upload with invalid admin key");
        return Err(ApiError::unauthorized("Invalid admin key"));
    }
    let form = UploadForm::from_multipart(multipart).await?;
    require_pdf(&form)?;
    Ok(stream_frames(move |sink| workflows::admin_upload(state, form, sink)))
}

/// `POST /upload-session`: index one PDF for a single thread.
pub(crate) async fn upload_session(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = UploadForm::from_multipart(multipart).await?;
    let file = require_pdf(&form)?;
    let thread_id = form
        .field("thread_id")
        .ok_or_else(|| ApiError::missing_field("thread_id"))?;

    let document = documents::load_document(&file.path)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let chunks = TextSplitter::from_config(&state.config.ingest).split_document(&document);
    let stored = state
        .knowledge
        .add_session_documents(&chunks, thread_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    info!(thread_id, chunks = stored, "Session document indexed");

    Ok(Json(json!({
        "status": "ok",
        "message": format!("Processed {stored} chunks for session {thread_id}"),
    })))
}

/// `POST /evaluate-candidates`: run a batch and return the whole report.
pub(crate) async fn evaluate_candidates(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<EvaluationReport>, ApiError> {
    let form = UploadForm::from_multipart(multipart).await?;
    let report = match EvaluationInputs::classify(&form.paths()) {
        Ok(inputs) => state.evaluator.run(&inputs, form.dir()).await,
        Err(e) => Err(e),
    };
    report.map(Json).map_err(|e| match e {
        EvaluationError::MissingInputs { .. }
        | EvaluationError::MissingColumn { .. }
        | EvaluationError::NoCandidates => ApiError::bad_request(e.to_string()),
        other => ApiError::internal(other.to_string()),
    })
}
