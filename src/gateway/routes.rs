//! HTTP handlers for tasks, executions, health and router status.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use tracing::{error, info};

use super::AppState;
use super::executions::{ExecutionParams, drive_execution};
use crate::error::DatabaseError;
use crate::tasks::{NewTask, TaskPatch, TaskQuery, TaskRecord};
use crate::worker::TaskExecutor;

/// Structured error body: `{ "error": message, "kind": ... }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "kind": self.kind,
        }));
        (self.status, body).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { .. } => Self::not_found(err.to_string()),
            DatabaseError::DuplicateKey { .. }
            | DatabaseError::Conflict { .. }
            | DatabaseError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, "conflict", err.to_string())
            }
            e if e.is_unavailable() => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                e.to_string(),
            ),
            e => {
                error!(error = %e, "Store error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// POST /tasks
async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TaskRecord>)> {
    let Json(new) = payload?;
    new.validate().map_err(ApiError::bad_request)?;
    let task = state.store.enqueue(new).await?;
    info!(task_id = %task.id, priority = task.priority, "Task enqueued");
    Ok((StatusCode::CREATED, Json(task.to_record(Utc::now()))))
}

/// GET /tasks?status=&id_prefix=&limit=
async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<TaskQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<TaskRecord>>> {
    let Query(query) = query?;
    let now = Utc::now();
    let tasks = state.store.list(&query).await?;
    Ok(Json(tasks.iter().map(|t| t.to_record(now)).collect()))
}

/// GET /tasks/{id}
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    let task = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    Ok(Json(task.to_record(Utc::now())))
}

/// PATCH /tasks/{id}
async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<TaskPatch>, JsonRejection>,
) -> ApiResult<Json<TaskRecord>> {
    let Json(patch) = payload?;
    if patch.is_empty() {
        return Err(ApiError::bad_request("patch has no fields"));
    }
    let task = state.store.update(&id, &patch).await?;
    info!(task_id = %id, status = %task.status, "Task updated manually");
    Ok(Json(task.to_record(Utc::now())))
}

/// DELETE /tasks/{id}
async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.store.delete(&id).await? {
        info!(task_id = %id, "Task deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("task {id} not found")))
    }
}

/// GET /tasks/{id}/result
async fn get_task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    if state.store.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("task {id} not found")));
    }
    let stored = state
        .store
        .get_result(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} has no result")))?;
    Ok(Json(stored).into_response())
}

/// POST /execute → 202 `{execution_id, status: "started"}`
async fn start_execution(
    State(state): State<AppState>,
    payload: Result<Json<ExecutionParams>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let Json(params) = payload?;
    if params.max_tasks == 0 {
        return Err(ApiError::bad_request("max_tasks must be at least 1"));
    }
    if let Some(ref backend) = params.backend
        && !state.router.has_backend(backend)
    {
        return Err(ApiError::bad_request(format!("unknown backend: {backend}")));
    }
    if state.shutdown.is_cancelled() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "gateway is shutting down",
        ));
    }

    let execution = state.executions.create(params.max_tasks).await;
    let executor = TaskExecutor::new(state.store.clone(), state.router.clone())
        .with_options(params.routing(&state.defaults));
    let registry = state.executions.clone();
    let shutdown = state.shutdown.clone();
    let id = execution.id.clone();
    state.tracker.spawn(async move {
        drive_execution(&registry, executor, id, params, shutdown).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "execution_id": execution.id, "status": "started" })),
    ))
}

/// GET /executions
async fn list_executions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.executions.list().await)
}

/// GET /executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let execution = state
        .executions
        .get(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("execution {id} not found")))?;
    Ok(Json(execution).into_response())
}

/// GET /health
async fn health(State(state): State<AppState>) -> Response {
    let uptime_seconds = state.started.elapsed().as_secs_f64();
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "store": "connected",
                "uptime_seconds": uptime_seconds,
                "running_executions": state.executions.running().await,
            })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Health check: store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "store": "unavailable",
                    "uptime_seconds": uptime_seconds,
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// GET /router/status
async fn router_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.status().await)
}

/// POST /router/reset-cost
async fn reset_cost(State(state): State<AppState>) -> impl IntoResponse {
    let previous = state.router.reset_cost().await;
    Json(json!({ "previous_total": previous.to_f64() }))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route(
            "/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/result", get(get_task_result))
        .route("/execute", post(start_execution))
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/health", get(health))
        .route("/router/status", get(router_status))
        .route("/router/reset-cost", post(reset_cost))
        .with_state(state)
}
