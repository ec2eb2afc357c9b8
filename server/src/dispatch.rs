//! HTTP surface of the judge. Execution failures are ordinary 200 responses
//! carrying the verdict; non-2xx is reserved for malformed requests and a
//! dead broker.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use judge_protocol::BatchRequest;
use judge_protocol::BatchResponse;
use judge_protocol::JudgeResult;
use judge_protocol::Mode;
use judge_protocol::Submission;
use serde::Serialize;

use crate::config::Config;
use crate::error::ServerError;
use crate::queue::WorkQueue;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<WorkQueue>,
    pub config: Arc<Config>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub queue: u64,
    pub num_workers: u64,
}

/// Whether the endpoint judges against `expected_output` or just runs the
/// program. "Run" strips the reference output before enqueueing, so the
/// worker pipeline is identical for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Judge,
    RunOnly,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/judge", post(judge))
        .route("/run", post(run))
        .route("/judge/batch", post(judge_batch))
        .route("/run/batch", post(run_batch))
        .route("/judge/long-batch", post(judge_long_batch))
        .route("/run/long-batch", post(run_long_batch))
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let snapshot = state.queue.status().await?;
    Ok(Json(StatusResponse {
        queue: snapshot.queue,
        num_workers: snapshot.num_workers,
    }))
}

async fn judge(
    State(state): State<AppState>,
    Json(submission): Json<Submission>,
) -> Result<Json<JudgeResult>, ApiError> {
    Ok(Json(
        submit_single(&state, submission, Comparison::Judge).await?,
    ))
}

async fn run(
    State(state): State<AppState>,
    Json(submission): Json<Submission>,
) -> Result<Json<JudgeResult>, ApiError> {
    Ok(Json(
        submit_single(&state, submission, Comparison::RunOnly).await?,
    ))
}

async fn judge_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    Ok(Json(
        submit_batch(&state, request, Mode::Short, Comparison::Judge).await?,
    ))
}

async fn run_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    Ok(Json(
        submit_batch(&state, request, Mode::Short, Comparison::RunOnly).await?,
    ))
}

async fn judge_long_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    Ok(Json(
        submit_batch(&state, request, Mode::Long, Comparison::Judge).await?,
    ))
}

async fn run_long_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    Ok(Json(
        submit_batch(&state, request, Mode::Long, Comparison::RunOnly).await?,
    ))
}

async fn submit_single(
    state: &AppState,
    mut submission: Submission,
    comparison: Comparison,
) -> Result<JudgeResult, ServerError> {
    if comparison == Comparison::RunOnly {
        submission.expected_output = None;
    }
    let pending = state.queue.submit(submission, Mode::Short).await?;
    state.queue.wait_result(&pending).await
}

/// Enqueue and collect chunk by chunk so per-request state stays bounded by
/// the chunk size, preserving input order across the whole batch.
async fn submit_batch(
    state: &AppState,
    mut request: BatchRequest,
    mode: Mode,
    comparison: Comparison,
) -> Result<BatchResponse, ServerError> {
    if comparison == Comparison::RunOnly {
        for submission in &mut request.submissions {
            submission.expected_output = None;
        }
    }
    let chunk_size = match mode {
        Mode::Short => state.config.max_batch_chunk_size,
        Mode::Long => state.config.max_long_batch_chunk_size,
    };
    let mut results = Vec::with_capacity(request.submissions.len());
    for chunk in request.submissions.chunks(chunk_size) {
        let mut pending = Vec::with_capacity(chunk.len());
        for submission in chunk {
            pending.push(state.queue.submit(submission.clone(), mode).await?);
        }
        for work in &pending {
            results.push(state.queue.wait_result(work).await?);
        }
    }
    Ok(BatchResponse {
        sub_id: request.sub_id,
        results,
    })
}

/// Broker trouble is the only thing this API turns into a 5xx.
pub struct ApiError(ServerError);

impl<E: Into<ServerError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("request failed: {}", self.0);
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
