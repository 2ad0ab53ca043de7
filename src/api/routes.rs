//! User-facing task, worker and delay routes.

use std::collections::HashMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use super::AppState;
use super::auth::Principal;
use super::error::ApiError;
use crate::delay::to_wire;
use crate::tasks::{TaskDetail, TaskId, TaskSummary};
use crate::workers::WorkerSummary;

#[derive(Debug, Deserialize)]
pub(super) struct AddTaskRequest {
    task: String,
}

pub(super) async fn add_task(
    State(state): State<AppState>,
    principal: Principal,
    body: Result<Json<AddTaskRequest>, JsonRejection>,
) -> Result<Json<TaskSummary>, ApiError> {
    let Json(body) = body?;
    let task = state
        .orchestrator
        .create_task(&principal.owner_id, &body.task)
        .await?;
    Ok(Json(task.summary()))
}

pub(super) async fn get_tasks(
    State(state): State<AppState>,
    principal: Principal,
) -> Json<Vec<TaskSummary>> {
    let tasks = state.orchestrator.list_tasks(&principal.owner_id).await;
    Json(tasks.iter().map(|t| t.summary()).collect())
}

#[derive(Debug, Deserialize)]
pub(super) struct TaskQuery {
    id: Option<String>,
}

pub(super) async fn get_task(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<TaskQuery>,
) -> Result<Json<TaskDetail>, ApiError> {
    let raw = query
        .id
        .ok_or_else(|| ApiError::BadRequest("missing task id".into()))?;
    let id: TaskId = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid task id '{raw}'")))?;
    let task = state
        .orchestrator
        .get_task_for(&principal.owner_id, id)
        .await?;
    Ok(Json(task.detail()))
}

pub(super) async fn get_workers(State(state): State<AppState>) -> Json<Vec<WorkerSummary>> {
    Json(state.orchestrator.workers().await)
}

pub(super) async fn get_delays(State(state): State<AppState>) -> impl IntoResponse {
    Json(to_wire(&state.orchestrator.delays().await))
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdateDelaysRequest {
    delays: HashMap<String, i64>,
}

pub(super) async fn update_delays(
    State(state): State<AppState>,
    body: Result<Json<UpdateDelaysRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let delays = state.orchestrator.update_delays(&body.delays).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "delays": to_wire(&delays),
    })))
}

pub(super) async fn get_info(principal: Principal) -> String {
    principal.display_name
}
