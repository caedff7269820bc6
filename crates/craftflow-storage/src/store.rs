//! Repository contracts and the shared mutation semantics both backends obey.
//!
//! Every mutating task operation takes the version the caller last observed
//! and fails with [`StoreError::VersionConflict`] when it is stale, with no
//! side effects. The mutation rules themselves (status graph, lease
//! ownership, timestamp bookkeeping) live here as pure functions over a
//! `Task`, so the redb and in-memory backends cannot drift apart.

use std::collections::BTreeMap;

use craftflow_models::{NewTask, QualityReport, Task, TaskStatus, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Filter for `TaskStore::list`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub workflow_type: Option<String>,
    /// Soft-deleted tasks are invisible unless this is set.
    pub include_deleted: bool,
}

/// Aggregate counts for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_workflow: BTreeMap<String, u64>,
}

/// One appended quality-check row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityCheckRecord {
    pub check_id: String,
    pub task_id: String,
    #[serde(flatten)]
    pub report: QualityReport,
}

impl QualityCheckRecord {
    pub fn new(task_id: &str, report: QualityReport) -> Self {
        Self {
            check_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            report,
        }
    }
}

/// Durable home of all task state.
pub trait TaskStore: Send + Sync {
    /// Create a task, or idempotently return the existing one with the same
    /// idempotency key.
    fn create(&self, input: NewTask) -> Result<Task>;

    fn find_by_id(&self, id: &str) -> Result<Option<Task>>;
    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>>;

    /// Deterministic ordering: `created_at DESC`, tie-break `task_id ASC`.
    /// `page` is 1-based.
    fn list(&self, filter: &TaskFilter, page: u64, limit: u64) -> Result<Vec<Task>>;

    fn update_status(&self, id: &str, status: TaskStatus, version: u64) -> Result<Task>;
    fn update_current_step(&self, id: &str, step: &str, version: u64) -> Result<Task>;

    /// Atomic claim: succeeds only while `status == pending` at `version`.
    fn claim_task(&self, id: &str, worker_id: &str, version: u64) -> Result<Task>;

    /// Return a leased task to `pending`. Succeeds only for the lease holder.
    fn release_worker(&self, id: &str, worker_id: &str, version: u64) -> Result<Task>;

    fn save_state_snapshot(&self, id: &str, snapshot: &Value, version: u64) -> Result<Task>;
    fn increment_retry_count(&self, id: &str, class: &str, version: u64) -> Result<Task>;

    fn mark_completed(&self, id: &str, version: u64) -> Result<Task>;
    fn mark_failed(&self, id: &str, message: &str, version: u64) -> Result<Task>;
    fn mark_cancelled(&self, id: &str, version: u64) -> Result<Task>;

    /// Pending tasks ordered `priority DESC, created_at ASC`, for the dispatcher.
    fn get_pending_tasks(&self, limit: usize) -> Result<Vec<Task>>;

    /// Running tasks whose `updated_at` is older than the cutoff, for lease recovery.
    fn get_stale_running(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<Task>>;

    fn soft_delete(&self, id: &str) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;

    fn stats(&self) -> Result<StoreStats>;
}

/// Append-oriented result repository. Rows are never updated.
pub trait ResultStore: Send + Sync {
    fn create(&self, record: &craftflow_models::ResultRecord) -> Result<()>;
    /// Newest first.
    fn find_by_task_id(&self, task_id: &str) -> Result<Vec<craftflow_models::ResultRecord>>;
    fn delete_by_task_id(&self, task_id: &str) -> Result<usize>;
}

/// Append-oriented quality-check repository.
pub trait QualityCheckStore: Send + Sync {
    fn create(&self, task_id: &str, report: &QualityReport) -> Result<()>;
    /// Newest first.
    fn find_by_task_id(&self, task_id: &str) -> Result<Vec<QualityCheckRecord>>;
    /// Most recent report for a phase; that row is authoritative.
    fn latest(&self, task_id: &str, phase: &str) -> Result<Option<QualityCheckRecord>>;
    fn delete_by_task_id(&self, task_id: &str) -> Result<usize>;
}

// ── Shared mutation rules ────────────────────────────────────────────

pub(crate) fn check_version(task: &Task, version: u64) -> Result<()> {
    if task.version != version {
        return Err(StoreError::VersionConflict(task.task_id.clone()));
    }
    Ok(())
}

pub(crate) fn bump(task: &mut Task) {
    task.version += 1;
    task.updated_at = now_ms();
}

pub(crate) fn apply_status(task: &mut Task, status: TaskStatus) -> Result<()> {
    if !task.status.can_transition_to(status) {
        return Err(StoreError::InvalidTransition {
            task_id: task.task_id.clone(),
            detail: format!("{} -> {}", task.status, status),
        });
    }
    if status == TaskStatus::Running && task.started_at.is_none() {
        task.started_at = Some(now_ms());
    }
    if status.is_terminal() {
        task.completed_at = Some(now_ms());
        task.worker_id = None;
    }
    if status == TaskStatus::Pending {
        task.worker_id = None;
    }
    task.status = status;
    Ok(())
}

pub(crate) fn apply_claim(task: &mut Task, worker_id: &str, version: u64) -> Result<()> {
    check_version(task, version)?;
    if task.status != TaskStatus::Pending {
        return Err(StoreError::VersionConflict(task.task_id.clone()));
    }
    apply_status(task, TaskStatus::Running)?;
    task.worker_id = Some(worker_id.to_string());
    task.current_step = Some("claimed".to_string());
    bump(task);
    Ok(())
}

pub(crate) fn apply_release(task: &mut Task, worker_id: &str, version: u64) -> Result<()> {
    check_version(task, version)?;
    if task.status != TaskStatus::Running || task.worker_id.as_deref() != Some(worker_id) {
        return Err(StoreError::LeaseMismatch {
            task_id: task.task_id.clone(),
            worker_id: worker_id.to_string(),
        });
    }
    apply_status(task, TaskStatus::Pending)?;
    bump(task);
    Ok(())
}

pub(crate) fn apply_terminal(
    task: &mut Task,
    status: TaskStatus,
    error_message: Option<&str>,
    version: u64,
) -> Result<()> {
    check_version(task, version)?;
    apply_status(task, status)?;
    task.error_message = error_message.map(|m| m.to_string());
    bump(task);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use craftflow_models::TaskMode;

    fn pending_task() -> Task {
        Task::new(NewTask {
            workflow_type: "content-creator".to_string(),
            mode: TaskMode::Async,
            priority: 0,
            idempotency_key: None,
            callback_url: None,
            callback_events: vec![],
            typed_inputs: serde_json::json!({}),
        })
    }

    #[test]
    fn claim_requires_pending_and_fresh_version() {
        let mut task = pending_task();
        apply_claim(&mut task, "worker-0", 1).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_id.as_deref(), Some("worker-0"));
        assert_eq!(task.current_step.as_deref(), Some("claimed"));
        assert_eq!(task.version, 2);

        // Second claim at the stale version loses.
        let err = apply_claim(&mut task, "worker-1", 1).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));
    }

    #[test]
    fn release_requires_lease_holder() {
        let mut task = pending_task();
        apply_claim(&mut task, "worker-0", 1).unwrap();

        let err = apply_release(&mut task, "worker-1", 2).unwrap_err();
        assert!(matches!(err, StoreError::LeaseMismatch { .. }));

        apply_release(&mut task, "worker-0", 2).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.worker_id.is_none());
    }

    #[test]
    fn terminal_transition_sets_completed_at_and_clears_worker() {
        let mut task = pending_task();
        apply_claim(&mut task, "worker-0", 1).unwrap();
        apply_terminal(&mut task, TaskStatus::Failed, Some("boom"), 2).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed_at.is_some());
        assert!(task.worker_id.is_none());
        assert_eq!(task.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn invalid_transition_rejected() {
        let mut task = pending_task();
        let err = apply_terminal(&mut task, TaskStatus::Completed, None, 1).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }
}
