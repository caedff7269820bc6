//! In-memory repositories.
//!
//! Drop-in replacements for the redb backends with identical semantics,
//! used by tests and selectable as a configured backend. The write lock
//! plays the role of the single-writer transaction.

use std::collections::HashMap;

use craftflow_models::{NewTask, QualityReport, ResultRecord, Task, TaskStatus, now_ms};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::{
    self, QualityCheckRecord, QualityCheckStore, ResultStore, StoreStats, TaskFilter, TaskStore,
};

#[derive(Default)]
struct TaskTables {
    tasks: HashMap<String, Task>,
    idempotency: HashMap<String, String>,
}

/// Task repository backed by a process-local map.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<TaskTables>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if task.deleted_at.is_some() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let mut staged = task.clone();
        f(&mut staged)?;
        *task = staged.clone();
        Ok(staged)
    }
}

impl TaskStore for MemoryTaskStore {
    fn create(&self, input: NewTask) -> Result<Task> {
        let mut inner = self.inner.write();
        if let Some(key) = input.idempotency_key.as_deref()
            && let Some(existing_id) = inner.idempotency.get(key).cloned()
            && let Some(existing) = inner.tasks.get(&existing_id)
            && existing.deleted_at.is_none()
        {
            return Ok(existing.clone());
        }

        let task = Task::new(input);
        if let Some(key) = task.idempotency_key.clone() {
            inner.idempotency.insert(key, task.task_id.clone());
        }
        inner.tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Task>> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .get(id)
            .filter(|t| t.deleted_at.is_none())
            .cloned())
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>> {
        let inner = self.inner.read();
        let Some(task_id) = inner.idempotency.get(key) else {
            return Ok(None);
        };
        Ok(inner
            .tasks
            .get(task_id)
            .filter(|t| t.deleted_at.is_none())
            .cloned())
    }

    fn list(&self, filter: &TaskFilter, page: u64, limit: u64) -> Result<Vec<Task>> {
        let inner = self.inner.read();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| filter.include_deleted || t.deleted_at.is_none())
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                filter
                    .workflow_type
                    .as_deref()
                    .is_none_or(|w| t.workflow_type == w)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        let offset = page.saturating_sub(1).saturating_mul(limit) as usize;
        Ok(tasks
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .collect())
    }

    fn update_status(&self, id: &str, status: TaskStatus, version: u64) -> Result<Task> {
        self.mutate(id, |task| {
            store::check_version(task, version)?;
            store::apply_status(task, status)?;
            store::bump(task);
            Ok(())
        })
    }

    fn update_current_step(&self, id: &str, step: &str, version: u64) -> Result<Task> {
        self.mutate(id, |task| {
            store::check_version(task, version)?;
            task.current_step = Some(step.to_string());
            store::bump(task);
            Ok(())
        })
    }

    fn claim_task(&self, id: &str, worker_id: &str, version: u64) -> Result<Task> {
        self.mutate(id, |task| store::apply_claim(task, worker_id, version))
    }

    fn release_worker(&self, id: &str, worker_id: &str, version: u64) -> Result<Task> {
        self.mutate(id, |task| store::apply_release(task, worker_id, version))
    }

    fn save_state_snapshot(&self, id: &str, snapshot: &Value, version: u64) -> Result<Task> {
        self.mutate(id, |task| {
            store::check_version(task, version)?;
            task.state_snapshot = Some(snapshot.clone());
            store::bump(task);
            Ok(())
        })
    }

    fn increment_retry_count(&self, id: &str, class: &str, version: u64) -> Result<Task> {
        self.mutate(id, |task| {
            store::check_version(task, version)?;
            *task.retry_counts.entry(class.to_string()).or_insert(0) += 1;
            store::bump(task);
            Ok(())
        })
    }

    fn mark_completed(&self, id: &str, version: u64) -> Result<Task> {
        self.mutate(id, |task| {
            store::apply_terminal(task, TaskStatus::Completed, None, version)
        })
    }

    fn mark_failed(&self, id: &str, message: &str, version: u64) -> Result<Task> {
        self.mutate(id, |task| {
            store::apply_terminal(task, TaskStatus::Failed, Some(message), version)
        })
    }

    fn mark_cancelled(&self, id: &str, version: u64) -> Result<Task> {
        self.mutate(id, |task| {
            store::apply_terminal(task, TaskStatus::Cancelled, None, version)
        })
    }

    fn get_pending_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let inner = self.inner.read();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.deleted_at.is_none() && t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn get_stale_running(&self, cutoff_ms: i64, limit: usize) -> Result<Vec<Task>> {
        let inner = self.inner.read();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                t.deleted_at.is_none()
                    && t.status == TaskStatus::Running
                    && t.updated_at < cutoff_ms
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.updated_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn soft_delete(&self, id: &str) -> Result<()> {
        self.mutate(id, |task| {
            task.deleted_at = Some(now_ms());
            store::bump(task);
            Ok(())
        })?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(key) = task.idempotency_key.as_deref() {
            inner.idempotency.remove(key);
        }
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.read();
        let mut stats = StoreStats::default();
        for task in inner.tasks.values() {
            if task.deleted_at.is_some() {
                continue;
            }
            stats.total += 1;
            *stats.by_status.entry(task.status.to_string()).or_insert(0) += 1;
            *stats
                .by_workflow
                .entry(task.workflow_type.clone())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}

/// Append-only result rows in memory.
#[derive(Default)]
pub struct MemoryResultStore {
    rows: RwLock<Vec<ResultRecord>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryResultStore {
    fn create(&self, record: &ResultRecord) -> Result<()> {
        self.rows.write().push(record.clone());
        Ok(())
    }

    fn find_by_task_id(&self, task_id: &str) -> Result<Vec<ResultRecord>> {
        let mut rows: Vec<ResultRecord> = self
            .rows
            .read()
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    fn delete_by_task_id(&self, task_id: &str) -> Result<usize> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|r| r.task_id != task_id);
        Ok(before - rows.len())
    }
}

/// Append-only quality-check rows in memory.
#[derive(Default)]
pub struct MemoryQualityCheckStore {
    rows: RwLock<Vec<QualityCheckRecord>>,
}

impl MemoryQualityCheckStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QualityCheckStore for MemoryQualityCheckStore {
    fn create(&self, task_id: &str, report: &QualityReport) -> Result<()> {
        self.rows
            .write()
            .push(QualityCheckRecord::new(task_id, report.clone()));
        Ok(())
    }

    fn find_by_task_id(&self, task_id: &str) -> Result<Vec<QualityCheckRecord>> {
        let mut rows: Vec<QualityCheckRecord> = self
            .rows
            .read()
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.report.checked_at.cmp(&a.report.checked_at));
        Ok(rows)
    }

    fn latest(&self, task_id: &str, phase: &str) -> Result<Option<QualityCheckRecord>> {
        Ok(self
            .find_by_task_id(task_id)?
            .into_iter()
            .find(|r| r.report.phase == phase))
    }

    fn delete_by_task_id(&self, task_id: &str) -> Result<usize> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|r| r.task_id != task_id);
        Ok(before - rows.len())
    }
}
