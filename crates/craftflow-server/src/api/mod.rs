//! Router assembly.

pub mod health;
pub mod response;
pub mod state;
pub mod tasks;
pub mod workflows;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use response::ApiResponse;
pub use state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/tasks",
            post(tasks::create_task).get(tasks::list_tasks),
        )
        .route(
            "/api/tasks/{id}",
            get(tasks::get_task).delete(tasks::cancel_task),
        )
        .route("/api/tasks/{id}/status", get(tasks::get_task_status))
        .route("/api/tasks/{id}/result", get(tasks::get_task_result))
        .route("/api/tasks/{id}/retry", post(tasks::retry_task))
        .route("/api/workflows", get(workflows::list_workflows))
        .route("/api/workflows/{workflow_type}", get(workflows::get_workflow))
        .route("/health", get(health::health))
        .route("/api/stats", get(health::stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use craftflow_engine::executor::CreateTaskRequest;
    use craftflow_engine::services::mock::{MockImage, MockLlm, MockSearch};
    use craftflow_engine::{
        CancelRegistry, EngineConfig, Services, SyncExecutor, TaskQueue, WorkflowRegistry,
    };
    use craftflow_models::{TaskMode, TaskStatus};
    use craftflow_storage::Storage;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const PASSING_EVAL: &str = r#"{"relevance": 9, "coherence": 9, "completeness": 9, "readability": 9, "suggestions": []}"#;

    fn test_state() -> AppState {
        let storage = Arc::new(Storage::in_memory());
        let registry = Arc::new(WorkflowRegistry::with_builtins());
        let llm = Arc::new(MockLlm::with_handler(|_, request| {
            let system = request
                .messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if system.contains("quality evaluator") {
                Ok(PASSING_EVAL.to_string())
            } else {
                Ok("一篇关于 AI 的短文。AI 正在改变世界。".to_string())
            }
        }));
        let services = Services::new(llm, Arc::new(MockSearch::new()), Arc::new(MockImage::new()));
        let config = Arc::new(EngineConfig::default());
        let cancellations = Arc::new(CancelRegistry::new());
        let executor = Arc::new(SyncExecutor::new(
            storage.clone(),
            registry.clone(),
            services,
            config,
            cancellations.clone(),
        ));
        AppState {
            storage,
            registry,
            executor,
            queue: Arc::new(TaskQueue::new()),
            cancellations,
            async_enabled: true,
            server_cancel: CancellationToken::new(),
        }
    }

    fn async_request() -> CreateTaskRequest {
        CreateTaskRequest {
            workflow_type: "translation".to_string(),
            mode: TaskMode::Async,
            params: serde_json::json!({
                "sourceText": "Hello",
                "sourceLang": "en",
                "targetLang": "zh"
            }),
            idempotency_key: None,
            callback_url: None,
            callback_events: vec![],
            priority: 0,
        }
    }

    #[tokio::test]
    async fn async_create_returns_202_and_enqueues() {
        let state = test_state();
        let (code, body) =
            tasks::create_task(State(state.clone()), axum::Json(async_request())).await;
        assert_eq!(code, axum::http::StatusCode::ACCEPTED);
        let data = body.0.data.unwrap();
        assert_eq!(data["status"], "pending");
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn unknown_workflow_returns_400() {
        let state = test_state();
        let mut request = async_request();
        request.workflow_type = "nope".to_string();
        let (code, body) = tasks::create_task(State(state), axum::Json(request)).await;
        assert_eq!(code, axum::http::StatusCode::BAD_REQUEST);
        assert!(!body.0.success);
    }

    #[tokio::test]
    async fn sync_create_returns_201_with_result() {
        let state = test_state();
        let mut request = async_request();
        request.mode = TaskMode::Sync;
        let (code, body) = tasks::create_task(State(state.clone()), axum::Json(request)).await;
        assert_eq!(code, axum::http::StatusCode::CREATED);
        let data = body.0.data.unwrap();
        assert_eq!(data["status"], "completed");

        // The result endpoint now serves it.
        let task_id = data["taskId"].as_str().unwrap().to_string();
        let (code, body) =
            tasks::get_task_result(State(state), Path(task_id.clone())).await;
        assert_eq!(code, axum::http::StatusCode::OK);
        let view = body.0.data.unwrap();
        assert_eq!(view.task_id, task_id);
        assert!(!view.results.is_empty());
    }

    #[tokio::test]
    async fn result_of_pending_task_is_400() {
        let state = test_state();
        let (_, body) =
            tasks::create_task(State(state.clone()), axum::Json(async_request())).await;
        let task_id = body.0.data.unwrap()["taskId"].as_str().unwrap().to_string();

        let (code, _) = tasks::get_task_result(State(state), Path(task_id)).await;
        assert_eq!(code, axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_endpoint_reports_progress() {
        let state = test_state();
        let (_, body) =
            tasks::create_task(State(state.clone()), axum::Json(async_request())).await;
        let task_id = body.0.data.unwrap()["taskId"].as_str().unwrap().to_string();

        let (code, body) = tasks::get_task_status(State(state), Path(task_id)).await;
        assert_eq!(code, axum::http::StatusCode::OK);
        let view = body.0.data.unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.progress, 0);
    }

    #[tokio::test]
    async fn missing_task_endpoints_return_404() {
        let state = test_state();
        let (code, _) = tasks::get_task(State(state.clone()), Path("nope".to_string())).await;
        assert_eq!(code, axum::http::StatusCode::NOT_FOUND);
        let (code, _) =
            tasks::get_task_status(State(state.clone()), Path("nope".to_string())).await;
        assert_eq!(code, axum::http::StatusCode::NOT_FOUND);
        let (code, _) = tasks::cancel_task(State(state), Path("nope".to_string())).await;
        assert_eq!(code, axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_pending_task() {
        let state = test_state();
        let (_, body) =
            tasks::create_task(State(state.clone()), axum::Json(async_request())).await;
        let task_id = body.0.data.unwrap()["taskId"].as_str().unwrap().to_string();

        let (code, body) = tasks::cancel_task(State(state.clone()), Path(task_id.clone())).await;
        assert_eq!(code, axum::http::StatusCode::OK);
        assert_eq!(body.0.data.unwrap()["status"], "cancelled");

        // A second cancel hits a terminal task.
        let (code, _) = tasks::cancel_task(State(state), Path(task_id)).await;
        assert_eq!(code, axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn workflows_listing_and_lookup() {
        let state = test_state();
        let body = workflows::list_workflows(
            State(state.clone()),
            Query(workflows::WorkflowListQuery {
                category: None,
                tags: None,
            }),
        )
        .await;
        assert!(body.0.data.unwrap().len() >= 2);

        let (code, _) =
            workflows::get_workflow(State(state.clone()), Path("content-creator".to_string()))
                .await;
        assert_eq!(code, axum::http::StatusCode::OK);
        let (code, _) =
            workflows::get_workflow(State(state), Path("missing".to_string())).await;
        assert_eq!(code, axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_checks() {
        let state = test_state();
        let (code, body) = health::health(State(state)).await;
        assert_eq!(code, axum::http::StatusCode::OK);
        let view = body.0.data.unwrap();
        assert_eq!(view.status, "ok");
        assert_eq!(view.checks["database"]["status"], "ok");
        assert_eq!(view.checks["queue"]["status"], "ok");
    }

    #[tokio::test]
    async fn retry_requires_failed_status() {
        let state = test_state();
        let (_, body) =
            tasks::create_task(State(state.clone()), axum::Json(async_request())).await;
        let task_id = body.0.data.unwrap()["taskId"].as_str().unwrap().to_string();

        let (code, _) = tasks::retry_task(State(state), Path(task_id)).await;
        assert_eq!(code, axum::http::StatusCode::BAD_REQUEST);
    }
}
