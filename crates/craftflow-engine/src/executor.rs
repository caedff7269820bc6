//! Task execution: the shared runner and the blocking (sync) executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use craftflow_models::{
    CallbackEvent, ErrorKind, NewTask, Task, TaskMode, TaskStatus, WorkflowState,
};
use craftflow_storage::{Storage, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cancellations::CancelRegistry;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::graph::GraphEngine;
use crate::node::NodeContext;
use crate::registry::{WorkflowFactory, WorkflowRegistry};
use crate::services::Services;
use crate::webhook::WebhookNotifier;

/// Create-task request shared by the HTTP surface and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub workflow_type: String,
    #[serde(default = "default_mode")]
    pub mode: TaskMode,
    pub params: Value,
    pub idempotency_key: Option<String>,
    pub callback_url: Option<String>,
    #[serde(default)]
    pub callback_events: Vec<CallbackEvent>,
    #[serde(default)]
    pub priority: i32,
}

fn default_mode() -> TaskMode {
    TaskMode::Sync
}

impl CreateTaskRequest {
    pub fn into_new_task(self) -> NewTask {
        NewTask {
            workflow_type: self.workflow_type,
            mode: self.mode,
            priority: self.priority,
            idempotency_key: self.idempotency_key,
            callback_url: self.callback_url,
            callback_events: self.callback_events,
            typed_inputs: self.params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// Structured outcome of one execution. Executors never throw; every
/// failure becomes one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_state: Option<Value>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default)]
    pub metadata: Value,
}

impl ExecutionResult {
    fn rejected(kind: ErrorKind, message: String) -> Self {
        Self {
            task_id: String::new(),
            status: TaskStatus::Failed,
            final_state: None,
            duration_ms: 0,
            error: Some(ExecutionError { kind, message }),
            metadata: Value::Object(Default::default()),
        }
    }
}

/// Drives one already-running task to a terminal state: graph execution,
/// result persistence, the terminal store transition. Shared by the sync
/// executor and the async workers.
pub struct TaskRunner {
    storage: Arc<Storage>,
    registry: Arc<WorkflowRegistry>,
    services: Services,
    config: Arc<EngineConfig>,
    cancellations: Arc<CancelRegistry>,
    notifier: Arc<WebhookNotifier>,
}

impl TaskRunner {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<WorkflowRegistry>,
        services: Services,
        config: Arc<EngineConfig>,
        cancellations: Arc<CancelRegistry>,
        notifier: Arc<WebhookNotifier>,
    ) -> Self {
        Self {
            storage,
            registry,
            services,
            config,
            cancellations,
            notifier,
        }
    }

    /// Execute `task` (status must be `running`) and finalize it.
    pub async fn run(&self, task: &Task, parent_cancel: &CancellationToken) -> ExecutionResult {
        let started = Instant::now();
        let task_id = task.task_id.clone();

        let factory = match self.registry.get(&task.workflow_type) {
            Ok(factory) => factory,
            Err(e) => return self.finalize_error(&task_id, started, None, e).await,
        };

        let initial_state = match factory.create_state(task) {
            Ok(state) => state,
            Err(e) => return self.finalize_error(&task_id, started, None, e).await,
        };

        // Resume from the checkpoint when one exists; the immutable inputs
        // always come from the freshly built state.
        let mut state = if task.state_snapshot.is_some() {
            match self
                .storage
                .checkpoints
                .restore(&task_id, &initial_state, &factory.immutable_inputs())
            {
                Ok(Some(restored)) => restored,
                Ok(None) => initial_state,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Checkpoint restore failed, starting fresh");
                    initial_state
                }
            }
        } else {
            initial_state
        };

        let cancel = self.cancellations.register(&task_id, parent_cancel);
        let timeout = match task.mode {
            TaskMode::Sync => self.config.sync_task_timeout(),
            TaskMode::Async => self.config.async_task_timeout(),
        };
        let deadline = started + timeout;

        let engine = GraphEngine::new(self.storage.clone(), self.config.clone())
            .with_notifier(self.notifier.clone());
        let ctx = NodeContext::new(self.services.clone(), cancel, self.config.clone());
        let graph = factory.create_graph();

        let outcome = engine.run(&graph, &mut state, &ctx, deadline).await;
        self.cancellations.remove(&task_id);

        match outcome {
            Ok(()) => self.finalize_success(&task_id, started, factory.as_ref(), &state).await,
            Err(e) => self.finalize_error(&task_id, started, Some(&state), e).await,
        }
    }

    async fn finalize_success(
        &self,
        task_id: &str,
        started: Instant,
        factory: &dyn WorkflowFactory,
        state: &WorkflowState,
    ) -> ExecutionResult {
        for record in factory.collect_results(state) {
            if let Err(e) = self.storage.results.create(&record) {
                warn!(task_id = %task_id, result_type = %record.result_type, error = %e, "Failed to persist result");
            }
        }

        let status = self.terminal_transition(task_id, |task| {
            self.storage.tasks.mark_completed(task_id, task.version)
        });
        info!(task_id = %task_id, duration_ms = started.elapsed().as_millis() as u64, "Task completed");

        ExecutionResult {
            task_id: task_id.to_string(),
            status: status.unwrap_or(TaskStatus::Completed),
            final_state: Some(state.to_snapshot()),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
            metadata: Value::Object(state.base.metadata.clone()),
        }
    }

    async fn finalize_error(
        &self,
        task_id: &str,
        started: Instant,
        state: Option<&WorkflowState>,
        err: EngineError,
    ) -> ExecutionResult {
        let kind = err.kind();
        let message = err.to_string();
        self.cancellations.remove(task_id);

        let status = if kind == ErrorKind::Cancelled {
            info!(task_id = %task_id, "Task cancelled");
            self.terminal_transition(task_id, |task| {
                self.storage.tasks.mark_cancelled(task_id, task.version)
            })
            .unwrap_or(TaskStatus::Cancelled)
        } else {
            error!(task_id = %task_id, kind = %kind, error = %message, "Task failed");
            self.terminal_transition(task_id, |task| {
                self.storage.tasks.mark_failed(task_id, &message, task.version)
            })
            .unwrap_or(TaskStatus::Failed)
        };

        ExecutionResult {
            task_id: task_id.to_string(),
            status,
            final_state: state.map(|s| s.to_snapshot()),
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(ExecutionError { kind, message }),
            metadata: state
                .map(|s| Value::Object(s.base.metadata.clone()))
                .unwrap_or(Value::Object(Default::default())),
        }
    }

    /// Apply a terminal transition with one re-read retry on a version
    /// conflict.
    fn terminal_transition<F>(&self, task_id: &str, op: F) -> Option<TaskStatus>
    where
        F: Fn(&Task) -> Result<Task, StoreError>,
    {
        for attempt in 0..2 {
            let task = match self.storage.tasks.find_by_id(task_id) {
                Ok(Some(task)) => task,
                Ok(None) => return None,
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Failed to read task for terminal transition");
                    return None;
                }
            };
            if task.status.is_terminal() {
                return Some(task.status);
            }
            match op(&task) {
                Ok(updated) => return Some(updated.status),
                Err(StoreError::VersionConflict(_)) if attempt == 0 => continue,
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Terminal transition failed");
                    return None;
                }
            }
        }
        None
    }
}

/// End-to-end in-process execution for blocking API calls.
pub struct SyncExecutor {
    storage: Arc<Storage>,
    registry: Arc<WorkflowRegistry>,
    runner: TaskRunner,
}

impl SyncExecutor {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<WorkflowRegistry>,
        services: Services,
        config: Arc<EngineConfig>,
        cancellations: Arc<CancelRegistry>,
    ) -> Self {
        let notifier = Arc::new(WebhookNotifier::new(
            config.webhook_retries,
            Duration::from_millis(config.webhook_backoff_ms),
        ));
        let runner = TaskRunner::new(
            storage.clone(),
            registry.clone(),
            services,
            config,
            cancellations,
            notifier,
        );
        Self {
            storage,
            registry,
            runner,
        }
    }

    /// Create and execute a task in-process, returning when it is terminal.
    pub async fn execute(
        &self,
        request: CreateTaskRequest,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();

        let factory = match self.registry.get(&request.workflow_type) {
            Ok(factory) => factory,
            Err(e) => return ExecutionResult::rejected(ErrorKind::Validation, e.to_string()),
        };
        if let Err(problems) = factory.validate_params(&request.params) {
            return ExecutionResult::rejected(ErrorKind::Validation, problems.join("; "));
        }

        let task = match self.storage.tasks.create(request.into_new_task()) {
            Ok(task) => task,
            Err(e) => return ExecutionResult::rejected(ErrorKind::Internal, e.to_string()),
        };

        // Idempotent replay: a finished task returns its stored outcome
        // without running anything again.
        if task.status.is_terminal() {
            return self.replay(&task, started);
        }
        if task.status != TaskStatus::Pending {
            // Another executor owns it right now; report where it stands.
            return ExecutionResult {
                task_id: task.task_id.clone(),
                status: task.status,
                final_state: task.state_snapshot.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
                metadata: Value::Object(Default::default()),
            };
        }

        let running = match self
            .storage
            .tasks
            .update_status(&task.task_id, TaskStatus::Running, task.version)
        {
            Ok(task) => task,
            Err(StoreError::VersionConflict(_)) => {
                // Lost the create/claim race (concurrent idempotent submit).
                let current = self
                    .storage
                    .tasks
                    .find_by_id(&task.task_id)
                    .ok()
                    .flatten()
                    .unwrap_or(task);
                return ExecutionResult {
                    task_id: current.task_id.clone(),
                    status: current.status,
                    final_state: current.state_snapshot.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                    metadata: Value::Object(Default::default()),
                };
            }
            Err(e) => return ExecutionResult::rejected(ErrorKind::Internal, e.to_string()),
        };

        self.runner.run(&running, cancel).await
    }

    fn replay(&self, task: &Task, started: Instant) -> ExecutionResult {
        ExecutionResult {
            task_id: task.task_id.clone(),
            status: task.status,
            final_state: task.state_snapshot.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: task.error_message.as_ref().map(|message| ExecutionError {
                kind: ErrorKind::Internal,
                message: message.clone(),
            }),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::{MockImage, MockLlm, MockSearch};

    const PASSING_EVAL: &str = r#"{"relevance": 9, "coherence": 9, "completeness": 9, "readability": 9, "suggestions": []}"#;

    fn article_text() -> String {
        // Comfortably inside a [5, 2000] word window, carries the keyword.
        let mut text = String::from("# AI overview\n\n");
        for _ in 0..30 {
            text.push_str("AI systems keep improving across many industries. ");
        }
        text.push_str("\n\nIn conclusion, AI matters.");
        text
    }

    fn content_llm() -> Arc<MockLlm> {
        let article = article_text();
        Arc::new(MockLlm::with_handler(move |_, request| {
            let system = request
                .messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if system.contains("quality evaluator") {
                Ok(PASSING_EVAL.to_string())
            } else if system.contains("image") {
                Ok(r#"{"score": 9}"#.to_string())
            } else {
                Ok(article.clone())
            }
        }))
    }

    fn executor_with(llm: Arc<MockLlm>) -> (Arc<Storage>, SyncExecutor) {
        let storage = Arc::new(Storage::in_memory());
        let registry = Arc::new(WorkflowRegistry::with_builtins());
        let services = Services::new(llm, Arc::new(MockSearch::new()), Arc::new(MockImage::new()));
        let executor = SyncExecutor::new(
            storage.clone(),
            registry,
            services,
            Arc::new(EngineConfig::default()),
            Arc::new(CancelRegistry::new()),
        );
        (storage, executor)
    }

    fn content_request(idempotency_key: Option<&str>) -> CreateTaskRequest {
        CreateTaskRequest {
            workflow_type: "content-creator".to_string(),
            mode: TaskMode::Sync,
            params: serde_json::json!({
                "topic": "AI",
                "requirements": "write about AI",
                "hardConstraints": {"minWords": 5, "maxWords": 2000, "keywords": ["AI"]}
            }),
            idempotency_key: idempotency_key.map(|k| k.to_string()),
            callback_url: None,
            callback_events: vec![],
            priority: 0,
        }
    }

    #[tokio::test]
    async fn sync_happy_path_completes_and_persists() {
        let (storage, executor) = executor_with(content_llm());
        let result = executor
            .execute(content_request(None), &CancellationToken::new())
            .await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert!(result.error.is_none());

        let state = result.final_state.unwrap();
        assert!(
            state["data"]["finalArticle"]
                .as_str()
                .unwrap()
                .contains("AI")
        );

        let stored = storage.tasks.find_by_id(&result.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.is_some());

        let results = storage.results.find_by_task_id(&result.task_id).unwrap();
        assert!(results.iter().any(|r| r.result_type == "finalArticle"));
        let checks = storage.quality.find_by_task_id(&result.task_id).unwrap();
        assert!(!checks.is_empty());
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected_not_thrown() {
        let (_storage, executor) = executor_with(content_llm());
        let mut request = content_request(None);
        request.workflow_type = "missing".to_string();
        let result = executor.execute(request, &CancellationToken::new()).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn invalid_params_are_rejected() {
        let (_storage, executor) = executor_with(content_llm());
        let mut request = content_request(None);
        request.params = serde_json::json!({"topic": "", "requirements": ""});
        let result = executor.execute(request, &CancellationToken::new()).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn idempotent_replay_returns_same_task_without_rerun() {
        let llm = content_llm();
        let (_storage, executor) = executor_with(llm.clone());

        let first = executor
            .execute(content_request(Some("key-1")), &CancellationToken::new())
            .await;
        assert_eq!(first.status, TaskStatus::Completed);
        let calls_after_first = llm.call_count();

        let second = executor
            .execute(content_request(Some("key-1")), &CancellationToken::new())
            .await;
        assert_eq!(second.task_id, first.task_id);
        assert_eq!(second.status, TaskStatus::Completed);
        // No additional LLM work on replay.
        assert_eq!(llm.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn permanent_service_failure_fails_the_task() {
        let llm = Arc::new(MockLlm::with_handler(|_, _| {
            Err(crate::services::ServiceError::Permanent(
                "invalid api key".to_string(),
            ))
        }));
        let (storage, executor) = executor_with(llm);
        let result = executor
            .execute(content_request(None), &CancellationToken::new())
            .await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::PermanentExternal);
        let stored = storage.tasks.find_by_id(&result.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.error_message.is_some());
    }
}
