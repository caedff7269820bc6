//! Worker pool: leases pending tasks and drives them to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use craftflow_models::{ErrorKind, Task, TaskStatus, WorkflowState};
use craftflow_storage::{Storage, StoreError};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancellations::CancelRegistry;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::executor::{ExecutionResult, TaskRunner};
use crate::queue::{QueueEnvelope, TaskQueue};
use crate::registry::WorkflowRegistry;
use crate::services::Services;
use crate::supervisor::LeaseSupervisor;
use crate::webhook::WebhookNotifier;

/// The async execution plant: dispatcher + N workers + lease supervisor.
pub struct WorkerPool {
    storage: Arc<Storage>,
    registry: Arc<WorkflowRegistry>,
    config: Arc<EngineConfig>,
    queue: Arc<TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<LeaseSupervisor>,
    runner: Arc<TaskRunner>,
    notifier: Arc<WebhookNotifier>,
    shutdown: CancellationToken,
    running: Mutex<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    pool_id: String,
}

impl WorkerPool {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<WorkflowRegistry>,
        services: Services,
        config: Arc<EngineConfig>,
        queue: Arc<TaskQueue>,
        cancellations: Arc<CancelRegistry>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(storage.clone(), queue.clone()));
        let supervisor = Arc::new(LeaseSupervisor::new(
            storage.clone(),
            Duration::from_millis(config.lease_ttl_ms),
        ));
        let notifier = Arc::new(WebhookNotifier::new(
            config.webhook_retries,
            Duration::from_millis(config.webhook_backoff_ms),
        ));
        let runner = Arc::new(TaskRunner::new(
            storage.clone(),
            registry.clone(),
            services,
            config.clone(),
            cancellations,
            notifier.clone(),
        ));

        Self {
            storage,
            registry,
            config,
            queue,
            dispatcher,
            supervisor,
            runner,
            notifier,
            shutdown: CancellationToken::new(),
            running: Mutex::new(false),
            handles: Mutex::new(Vec::new()),
            pool_id: Uuid::new_v4().to_string()[..8].to_string(),
        }
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    /// Start dispatcher, supervisor and workers. Idempotent.
    pub async fn start(&self) {
        {
            let mut running = self.running.lock().await;
            if *running {
                return;
            }
            *running = true;
        }

        // Startup recovery: leases orphaned by a previous process.
        let reclaimed = self.supervisor.tick();
        if reclaimed > 0 {
            info!(reclaimed, "Recovered stalled tasks at startup");
        }

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(self.dispatcher.clone().run(
            Duration::from_millis(self.config.dispatcher_interval_ms),
            self.shutdown.clone(),
        )));
        handles.push(tokio::spawn(
            self.supervisor.clone().run(self.shutdown.clone()),
        ));

        info!(
            workers = self.config.worker_count,
            pool = %self.pool_id,
            "Starting workers"
        );
        for index in 0..self.config.worker_count {
            let worker = Worker {
                worker_id: format!("{}-w{}", self.pool_id, index),
                storage: self.storage.clone(),
                registry: self.registry.clone(),
                queue: self.queue.clone(),
                dispatcher: self.dispatcher.clone(),
                runner: self.runner.clone(),
                notifier: self.notifier.clone(),
                shutdown: self.shutdown.clone(),
                poll_interval: Duration::from_millis(self.config.queue_poll_ms),
            };
            handles.push(tokio::spawn(async move {
                worker.run_loop().await;
            }));
        }
    }

    /// Graceful shutdown: stop claiming, cancel in-flight tasks
    /// cooperatively, wait out the grace period.
    pub async fn shutdown(&self) {
        info!(pool = %self.pool_id, "Worker pool shutting down");
        self.shutdown.cancel();

        let grace = self.config.cancel_grace();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("A worker did not stop within the grace period");
            }
        }
        *self.running.lock().await = false;
    }
}

struct Worker {
    worker_id: String,
    storage: Arc<Storage>,
    registry: Arc<WorkflowRegistry>,
    queue: Arc<TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    runner: Arc<TaskRunner>,
    notifier: Arc<WebhookNotifier>,
    shutdown: CancellationToken,
    poll_interval: Duration,
}

impl Worker {
    async fn run_loop(&self) {
        info!(worker_id = %self.worker_id, "Worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.queue.try_dequeue() {
                Some(envelope) => self.process(envelope).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.queue.wait_for_task() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "Worker stopped");
    }

    async fn process(&self, envelope: QueueEnvelope) {
        let task_id = envelope.task_id.clone();

        // The store is canonical; the envelope may be stale.
        let task = match self.storage.tasks.find_by_id(&task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.dispatcher.mark_done(&task_id);
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Worker failed to read task");
                self.dispatcher.mark_done(&task_id);
                return;
            }
        };
        if task.status != TaskStatus::Pending {
            debug!(task_id = %task_id, status = %task.status, "Skipping task no longer pending");
            self.dispatcher.mark_done(&task_id);
            return;
        }

        let claimed = match self
            .storage
            .tasks
            .claim_task(&task_id, &self.worker_id, task.version)
        {
            Ok(task) => task,
            Err(StoreError::VersionConflict(_)) | Err(StoreError::NotFound(_)) => {
                debug!(task_id = %task_id, "Another worker claimed the task first");
                self.dispatcher.mark_done(&task_id);
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Claim failed");
                self.dispatcher.mark_done(&task_id);
                return;
            }
        };
        info!(task_id = %task_id, worker_id = %self.worker_id, "Task claimed");

        let outcome = self.runner.run(&claimed, &self.shutdown).await;
        self.notify(&task_id, &outcome).await;
        self.dispatcher.mark_done(&task_id);
    }

    async fn notify(&self, task_id: &str, outcome: &ExecutionResult) {
        let Ok(Some(task)) = self.storage.tasks.find_by_id(task_id) else {
            return;
        };
        match outcome.status {
            TaskStatus::Completed => {
                let (content, tokens_used) = self.deliverable(&task, outcome);
                self.notifier
                    .notify_completed(
                        &task,
                        content,
                        json!({
                            "tokensUsed": tokens_used,
                            "duration": outcome.duration_ms,
                        }),
                    )
                    .await;
            }
            TaskStatus::Failed => {
                let (kind, message) = outcome
                    .error
                    .as_ref()
                    .map(|e| (e.kind, e.message.clone()))
                    .unwrap_or((ErrorKind::Internal, "unknown failure".to_string()));
                self.notifier.notify_failed(&task, kind, message).await;
            }
            _ => {}
        }
    }

    /// Primary content and token usage for the completed-event payload.
    fn deliverable(&self, task: &Task, outcome: &ExecutionResult) -> (Option<String>, u64) {
        let Some(snapshot) = outcome.final_state.as_ref() else {
            return (None, 0);
        };
        let Ok(state) = WorkflowState::from_snapshot(snapshot) else {
            return (None, 0);
        };
        let content = self
            .registry
            .get(&task.workflow_type)
            .ok()
            .and_then(|factory| factory.primary_content(&state));
        let tokens_used = state
            .data
            .values()
            .filter_map(|v| v.get("details"))
            .filter_map(|d| d.get("tokensUsed"))
            .filter_map(|t| t.as_u64())
            .sum();
        (content, tokens_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CreateTaskRequest;
    use crate::services::mock::{MockImage, MockLlm, MockSearch};
    use craftflow_models::TaskMode;
    use std::time::Instant;

    const PASSING_EVAL: &str = r#"{"relevance": 9, "coherence": 9, "completeness": 9, "readability": 9, "suggestions": []}"#;

    fn translation_llm() -> Arc<MockLlm> {
        Arc::new(MockLlm::with_handler(|_, request| {
            let system = request
                .messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if system.contains("quality evaluator") {
                Ok(PASSING_EVAL.to_string())
            } else {
                Ok("你好，世界".to_string())
            }
        }))
    }

    fn pool_with(config: EngineConfig) -> (Arc<Storage>, Arc<WorkerPool>) {
        let storage = Arc::new(Storage::in_memory());
        let registry = Arc::new(WorkflowRegistry::with_builtins());
        let services = Services::new(
            translation_llm(),
            Arc::new(MockSearch::new()),
            Arc::new(MockImage::new()),
        );
        let pool = Arc::new(WorkerPool::new(
            storage.clone(),
            registry,
            services,
            Arc::new(config),
            Arc::new(TaskQueue::new()),
            Arc::new(CancelRegistry::new()),
        ));
        (storage, pool)
    }

    fn translation_task(storage: &Storage) -> Task {
        let request = CreateTaskRequest {
            workflow_type: "translation".to_string(),
            mode: TaskMode::Async,
            params: serde_json::json!({
                "sourceText": "Hello, world",
                "sourceLang": "en",
                "targetLang": "zh"
            }),
            idempotency_key: None,
            callback_url: None,
            callback_events: vec![],
            priority: 0,
        };
        storage.tasks.create(request.into_new_task()).unwrap()
    }

    async fn wait_for_status(
        storage: &Storage,
        task_id: &str,
        status: TaskStatus,
        timeout: Duration,
    ) -> Task {
        let deadline = Instant::now() + timeout;
        loop {
            let task = storage.tasks.find_by_id(task_id).unwrap().unwrap();
            if task.status == status {
                return task;
            }
            if Instant::now() >= deadline {
                panic!(
                    "task {} did not reach {:?} in time (currently {:?})",
                    task_id, status, task.status
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn pool_drains_pending_tasks() {
        let mut config = EngineConfig::default();
        config.dispatcher_interval_ms = 20;
        config.queue_poll_ms = 20;
        let (storage, pool) = pool_with(config);

        let task = translation_task(&storage);
        pool.start().await;

        let done = wait_for_status(
            &storage,
            &task.task_id,
            TaskStatus::Completed,
            Duration::from_secs(5),
        )
        .await;
        assert!(done.worker_id.is_none());
        assert!(done.completed_at.is_some());

        let results = storage.results.find_by_task_id(&task.task_id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result_type, "text");

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (_storage, pool) = pool_with(EngineConfig::default());
        pool.start().await;
        pool.start().await;
        let handle_count = pool.handles.lock().await.len();
        // dispatcher + supervisor + workers, spawned once.
        assert_eq!(handle_count, 2 + pool.config.worker_count);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_claiming() {
        let mut config = EngineConfig::default();
        config.dispatcher_interval_ms = 20;
        let (storage, pool) = pool_with(config);

        pool.start().await;
        pool.shutdown().await;

        let task = translation_task(&storage);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let current = storage.tasks.find_by_id(&task.task_id).unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Pending);
    }
}
