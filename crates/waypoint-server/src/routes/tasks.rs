use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use waypoint_schema::{Task, TaskStatus, TaskType};
use waypoint_tasks::{NewTask, TaskFilter};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub deduplicated: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub status: TaskStatus,
    #[serde(flatten)]
    pub task: Task,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            status: task.status(),
            task,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub itinerary_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(submit_task))
        .route("/{id}", get(get_task))
        .route("/{id}/cancel", post(cancel_task))
}

pub async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<NewTask>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let receipt = state.pipeline.tasks().submit(body).await?;
    let status = if receipt.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(SubmitResponse {
            task_id: receipt.task_id,
            status: receipt.status,
            deduplicated: receipt.deduplicated,
        }),
    ))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskView>, ApiError> {
    let task = state
        .pipeline
        .tasks()
        .get(task_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("task not found: {task_id}")))?;
    Ok(Json(task.into()))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let filter = TaskFilter {
        status: params.status,
        task_type: params.task_type,
        itinerary_id: params.itinerary_id,
        limit: params.limit.or(Some(100)),
    };
    let tasks = state.pipeline.tasks().list(&filter).await?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<TaskView>, ApiError> {
    let body: CancelBody = if body.is_empty() {
        CancelBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))?
    };
    let reason = body
        .reason
        .unwrap_or_else(|| "cancelled by request".to_string());
    let task = state.pipeline.tasks().cancel(task_id, &reason).await?;
    Ok(Json(task.into()))
}
