//! Task entity and its state machine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::time::now_ms;

/// Execution mode requested by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// The HTTP request blocks until the result is ready.
    Sync,
    /// The task is queued; a worker pool executes it and a webhook reports back.
    Async,
}

/// Task lifecycle status.
///
/// Transitions only along `pending → running → {completed, failed, cancelled}`
/// plus the quality-retry detour `running → waiting → running`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the status graph permits `self → next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Waiting) | (Waiting, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Waiting, Failed) | (Waiting, Cancelled) => true,
            // Lease recovery returns an orphaned running task to pending.
            (Running, Pending) => true,
            // Client retry of a failed task re-creates the execution.
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Webhook event classes a client may subscribe to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallbackEvent {
    Completed,
    Failed,
    Progress,
}

impl std::fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallbackEvent::Completed => "completed",
            CallbackEvent::Failed => "failed",
            CallbackEvent::Progress => "progress",
        };
        f.write_str(s)
    }
}

/// The root entity: one row per submitted workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub workflow_type: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub priority: i32,
    pub current_step: Option<String>,
    /// Lease holder; non-null only while `status == running`.
    pub worker_id: Option<String>,
    /// Optimistic-locking fence. Every mutation increments it.
    pub version: u64,
    /// Per-class quality-retry counters (e.g. `text`, `image`).
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    /// Last-saved workflow state (the checkpoint). Opaque to the store.
    pub state_snapshot: Option<Value>,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub callback_url: Option<String>,
    #[serde(default)]
    pub callback_enabled: bool,
    #[serde(default)]
    pub callback_events: Vec<CallbackEvent>,
    /// Workflow-specific request payload. Immutable after create.
    pub typed_inputs: Value,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// Input for `TaskStore::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub workflow_type: String,
    pub mode: TaskMode,
    #[serde(default)]
    pub priority: i32,
    pub idempotency_key: Option<String>,
    pub callback_url: Option<String>,
    #[serde(default)]
    pub callback_events: Vec<CallbackEvent>,
    pub typed_inputs: Value,
}

impl Task {
    /// Build a fresh pending task with `version = 1`.
    ///
    /// The task id is the idempotency key when the client supplied one,
    /// otherwise a server-generated UUID.
    pub fn new(input: NewTask) -> Self {
        let now = now_ms();
        let task_id = input
            .idempotency_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let callback_enabled = input.callback_url.is_some();

        Self {
            task_id,
            workflow_type: input.workflow_type,
            mode: input.mode,
            status: TaskStatus::Pending,
            priority: input.priority,
            current_step: None,
            worker_id: None,
            version: 1,
            retry_counts: BTreeMap::new(),
            state_snapshot: None,
            error_message: None,
            idempotency_key: input.idempotency_key,
            callback_url: input.callback_url,
            callback_enabled,
            callback_events: input.callback_events,
            typed_inputs: input.typed_inputs,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Whether `event` should be delivered for this task's subscription.
    pub fn wants_callback(&self, event: CallbackEvent) -> bool {
        self.callback_enabled
            && self.callback_url.is_some()
            && self.callback_events.contains(&event)
    }
}
