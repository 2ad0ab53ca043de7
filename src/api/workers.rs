//! Worker-facing routes used by `HttpClient`.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::AppState;
use super::auth::WorkerCaller;
use super::error::ApiError;
use crate::workers::model::{HeartbeatAck, HeartbeatRequest};
use crate::workers::{ReportOutcome, ResultReport};

pub(super) async fn heartbeat(
    _caller: WorkerCaller,
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> Json<HeartbeatAck> {
    let reported = body.map(|Json(b)| b.status).unwrap_or_default();
    Json(state.orchestrator.heartbeat(&worker_id, reported).await)
}

pub(super) async fn next(
    _caller: WorkerCaller,
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Response {
    match state.orchestrator.next_assignment(&worker_id).await {
        Some(assignment) => Json(assignment).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub(super) async fn report(
    _caller: WorkerCaller,
    State(state): State<AppState>,
    report: Result<Json<ResultReport>, JsonRejection>,
) -> Result<Json<ReportOutcome>, ApiError> {
    let Json(report) = report?;
    Ok(Json(state.orchestrator.report_result(report).await?))
}
