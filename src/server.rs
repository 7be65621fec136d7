//! HTTP surface of the relay itself.
//!
//! Thin handlers over the orchestrator and the store, plus a passthrough
//! to the worker's queue-management endpoints for operators.

use crate::client::WorkerClient;
use crate::orchestrator::{Orchestrator, TranscribeRequest};
use crate::store::Database;
use crate::RelayError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

// Uploads beyond this are rejected before buffering.
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub orchestrator: Arc<Orchestrator>,
    pub client: WorkerClient,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/transcribe", post(transcribe))
        .route("/api/records", get(list_records))
        .route("/api/records/:id", get(get_record).delete(delete_record))
        .route("/api/records/:id/risk-analysis", post(analyze_record))
        .route("/api/tracking", get(list_tracking))
        .route("/api/tracking/:handle/cancel", post(cancel_tracking))
        .route("/api/worker/queue/stats", get(worker_queue_stats))
        .route("/api/worker/queue/history", get(worker_queue_history))
        .route("/api/worker/queue/cleanup", post(worker_queue_cleanup))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// API error envelope. Maps the error taxonomy onto HTTP statuses.
struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::SubmissionTransport { .. }
            | RelayError::WorkerFailure(_)
            | RelayError::TransientExhausted(_)
            | RelayError::Http(_) => StatusCode::BAD_GATEWAY,
            RelayError::TimeoutExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Cancelled(_) => StatusCode::CONFLICT,
            RelayError::Storage(_) | RelayError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(kind = self.0.kind(), "request failed: {}", self.0);
        }
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    // Worker reachability is advisory; the relay is healthy either way.
    let worker = match state.client.queue_stats().await {
        Ok(stats) => json!({ "reachable": true, "queue": stats }),
        Err(err) => json!({ "reachable": false, "detail": err.to_string() }),
    };
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "worker": worker,
    }))
}

#[derive(Debug, Deserialize)]
struct TranscribeParams {
    language: Option<String>,
    /// Declared media duration in seconds; sizes the wait budget.
    #[serde(default)]
    duration_seconds: f64,
    #[serde(default)]
    risk_analysis: bool,
    /// Block until the job settles instead of returning the tracking row.
    #[serde(default)]
    sync: bool,
}

async fn transcribe(
    State(state): State<AppState>,
    Query(params): Query<TranscribeParams>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let (file_name, bytes) = read_audio_part(multipart).await?;
    let request = TranscribeRequest {
        file_name,
        bytes,
        language: params.language,
        duration_secs: params.duration_seconds,
        risk_analysis: params.risk_analysis,
    };

    if params.sync {
        let record = state.orchestrator.submit_transcription_sync(request).await?;
        Ok(Json(record).into_response())
    } else {
        let tracking = state.orchestrator.submit_transcription(request).await?;
        Ok((StatusCode::ACCEPTED, Json(tracking)).into_response())
    }
}

async fn read_audio_part(mut multipart: Multipart) -> ApiResult<(String, Vec<u8>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::Validation(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("audio") {
            continue;
        }
        let file_name = field
            .file_name()
            .unwrap_or("upload.bin")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| RelayError::Validation(format!("could not read audio field: {e}")))?;
        return Ok((file_name, bytes.to_vec()));
    }
    Err(RelayError::Validation("missing multipart field 'audio'".to_string()).into())
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_records(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Response> {
    let records = state.db.list_transcripts(params.limit.clamp(1, 1000)).await?;
    Ok(Json(records).into_response())
}

async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    match state.db.get_transcript(&id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(RelayError::NotFound(format!("transcript {id}")).into()),
    }
}

async fn delete_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    if state.db.delete_transcript(&id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(RelayError::NotFound(format!("transcript {id}")).into())
    }
}

async fn analyze_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let tracking = state.orchestrator.submit_risk_analysis(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(tracking)).into_response())
}

async fn list_tracking(State(state): State<AppState>) -> ApiResult<Response> {
    let rows = state.db.list_tracking().await?;
    Ok(Json(rows).into_response())
}

/// Stop observing a job. The worker keeps running it; a late completion
/// can still promote through the push feed.
async fn cancel_tracking(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> ApiResult<Response> {
    if state.orchestrator.cancel(&handle).await? {
        Ok(Json(json!({ "handle": handle, "cancelled": true })).into_response())
    } else {
        Err(RelayError::NotFound(format!("active job {handle}")).into())
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    status: Option<String>,
}

async fn worker_queue_stats(State(state): State<AppState>) -> ApiResult<Response> {
    let stats = state.client.queue_stats().await?;
    Ok(Json(stats).into_response())
}

async fn worker_queue_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Response> {
    let history = state
        .client
        .queue_history(params.limit, params.status.as_deref())
        .await?;
    Ok(Json(history).into_response())
}

async fn worker_queue_cleanup(State(state): State<AppState>) -> ApiResult<Response> {
    let result = state.client.queue_cleanup().await?;
    Ok(Json(result).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let cases = [
            (RelayError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (RelayError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                RelayError::WorkerFailure("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                RelayError::TimeoutExceeded("x".into()),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                RelayError::TransientExhausted("x".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (RelayError::Cancelled("x".into()), StatusCode::CONFLICT),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
