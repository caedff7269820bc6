//! Task endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use craftflow_engine::executor::{CreateTaskRequest, ExecutionResult};
use craftflow_models::{ErrorKind, Task, TaskMode, TaskStatus};
use craftflow_storage::{QualityCheckRecord, StoreError, TaskFilter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::api::{ApiResponse, state::AppState};

#[derive(Deserialize)]
pub struct TaskListQuery {
    page: Option<u64>,
    limit: Option<u64>,
    status: Option<TaskStatus>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub current_step: Option<String>,
    pub progress: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultView {
    pub task_id: String,
    pub status: TaskStatus,
    pub results: Vec<craftflow_models::ResultRecord>,
    pub quality_checks: Vec<QualityCheckRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_state: Option<Value>,
}

/// `POST /api/tasks` — 201 for sync execution, 202 for an accepted async task.
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> (StatusCode, Json<ApiResponse<Value>>) {
    let factory = match state.registry.get(&request.workflow_type) {
        Ok(factory) => factory,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(e.to_string())),
            );
        }
    };
    if let Err(problems) = factory.validate_params(&request.params) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(problems.join("; "))),
        );
    }

    match request.mode {
        TaskMode::Sync => {
            let result = state.executor.execute(request, &state.server_cancel).await;
            let status = match &result.error {
                Some(e) if e.kind == ErrorKind::Validation && result.task_id.is_empty() => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::CREATED,
            };
            (
                status,
                Json(ApiResponse::ok(serde_json::to_value(result).unwrap_or_default())),
            )
        }
        TaskMode::Async => {
            let task = match state.storage.tasks.create(request.into_new_task()) {
                Ok(task) => task,
                Err(e) => {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(ApiResponse::error(e.to_string())),
                    );
                }
            };
            if task.status == TaskStatus::Pending {
                state.queue.enqueue(craftflow_engine::QueueEnvelope::new(
                    &task.task_id,
                    &task.workflow_type,
                    task.priority,
                ));
            }
            info!(task_id = %task.task_id, workflow = %task.workflow_type, "Async task accepted");
            (
                StatusCode::ACCEPTED,
                Json(ApiResponse::ok(
                    json!({"taskId": task.task_id, "status": task.status}),
                )),
            )
        }
    }
}

/// `GET /api/tasks` — paginated list, newest first.
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Json<ApiResponse<Vec<Task>>> {
    let filter = TaskFilter {
        status: query.status,
        ..Default::default()
    };
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    match state.storage.tasks.list(&filter, page, limit) {
        Ok(tasks) => Json(ApiResponse::ok(tasks)),
        Err(e) => Json(ApiResponse::error(format!("Failed to list tasks: {e}"))),
    }
}

/// `GET /api/tasks/{id}`
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<Task>>) {
    match state.storage.tasks.find_by_id(&task_id) {
        Ok(Some(task)) => (StatusCode::OK, Json(ApiResponse::ok(task))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("task not found: {task_id}"))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// `GET /api/tasks/{id}/status` — status plus progress percentage.
pub async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<TaskStatusView>>) {
    let task = match state.storage.tasks.find_by_id(&task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("task not found: {task_id}"))),
            );
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            );
        }
    };

    let progress = if task.status == TaskStatus::Completed {
        100
    } else {
        state
            .registry
            .get(&task.workflow_type)
            .map(|factory| factory.metadata().progress_percent(task.current_step.as_deref()))
            .unwrap_or(0)
    };

    (
        StatusCode::OK,
        Json(ApiResponse::ok(TaskStatusView {
            task_id: task.task_id.clone(),
            status: task.status,
            current_step: task.current_step.clone(),
            progress,
        })),
    )
}

/// `GET /api/tasks/{id}/result` — 400 until the task has completed.
pub async fn get_task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<TaskResultView>>) {
    let task = match state.storage.tasks.find_by_id(&task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("task not found: {task_id}"))),
            );
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            );
        }
    };

    if task.status != TaskStatus::Completed {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!(
                "task {task_id} is {}, result not available",
                task.status
            ))),
        );
    }

    let results = state
        .storage
        .results
        .find_by_task_id(&task_id)
        .unwrap_or_default();
    let quality_checks = state
        .storage
        .quality
        .find_by_task_id(&task_id)
        .unwrap_or_default();

    (
        StatusCode::OK,
        Json(ApiResponse::ok(TaskResultView {
            task_id: task.task_id.clone(),
            status: task.status,
            results,
            quality_checks,
            final_state: task.state_snapshot.clone(),
        })),
    )
}

/// `POST /api/tasks/{id}/retry` — re-create execution; only for `failed`.
pub async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<Value>>) {
    let task = match state.storage.tasks.find_by_id(&task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("task not found: {task_id}"))),
            );
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            );
        }
    };
    if task.status != TaskStatus::Failed {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!(
                "only failed tasks can be retried; task is {}",
                task.status
            ))),
        );
    }

    let pending = match state
        .storage
        .tasks
        .update_status(&task_id, TaskStatus::Pending, task.version)
    {
        Ok(task) => task,
        Err(StoreError::VersionConflict(_)) => {
            return (
                StatusCode::CONFLICT,
                Json(ApiResponse::error("task changed concurrently, retry again".to_string())),
            );
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            );
        }
    };
    info!(task_id = %task_id, "Retrying failed task");

    match pending.mode {
        TaskMode::Async => {
            state.queue.enqueue(craftflow_engine::QueueEnvelope::new(
                &pending.task_id,
                &pending.workflow_type,
                pending.priority,
            ));
            (
                StatusCode::OK,
                Json(ApiResponse::ok(
                    json!({"taskId": pending.task_id, "status": pending.status}),
                )),
            )
        }
        TaskMode::Sync => {
            // Re-run inline, same as the original blocking call.
            let running = match state.storage.tasks.update_status(
                &pending.task_id,
                TaskStatus::Running,
                pending.version,
            ) {
                Ok(task) => task,
                Err(e) => {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(ApiResponse::error(e.to_string())),
                    );
                }
            };
            let result: ExecutionResult = state
                .executor
                .runner()
                .run(&running, &state.server_cancel)
                .await;
            (
                StatusCode::OK,
                Json(ApiResponse::ok(serde_json::to_value(result).unwrap_or_default())),
            )
        }
    }
}

/// `DELETE /api/tasks/{id}` — cancel.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<Value>>) {
    let task = match state.storage.tasks.find_by_id(&task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("task not found: {task_id}"))),
            );
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            );
        }
    };

    match task.status {
        TaskStatus::Pending => match state
            .storage
            .tasks
            .mark_cancelled(&task_id, task.version)
        {
            Ok(cancelled) => (
                StatusCode::OK,
                Json(ApiResponse::ok(
                    json!({"taskId": cancelled.task_id, "status": cancelled.status}),
                )),
            ),
            Err(e) => (
                StatusCode::CONFLICT,
                Json(ApiResponse::error(e.to_string())),
            ),
        },
        TaskStatus::Running | TaskStatus::Waiting => {
            if state.cancellations.cancel(&task_id) {
                info!(task_id = %task_id, "Cancellation signalled");
                (
                    StatusCode::OK,
                    Json(ApiResponse::ok(
                        json!({"taskId": task_id, "status": "cancelling"}),
                    )),
                )
            } else {
                (
                    StatusCode::CONFLICT,
                    Json(ApiResponse::error(
                        "task is running but not executing in this process".to_string(),
                    )),
                )
            }
        }
        status => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!(
                "task is {status} and cannot be cancelled"
            ))),
        ),
    }
}
