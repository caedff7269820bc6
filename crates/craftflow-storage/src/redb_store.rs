//! redb-backed repositories.
//!
//! One primary table per entity, string keys, JSON byte values. The
//! optimistic-locking protocol is realized as read-modify-write inside a
//! single write transaction: redb serializes writers, so a stale version is
//! always observed before the row is touched and the transaction aborts with
//! no side effects.

use std::sync::Arc;

use craftflow_models::{NewTask, QualityReport, ResultRecord, Task, TaskStatus, now_ms};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::{
    self, QualityCheckRecord, QualityCheckStore, ResultStore, StoreStats, TaskFilter, TaskStore,
};

const TASK_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Index: idempotency_key -> task_id
const IDEMPOTENCY_INDEX: TableDefinition<&str, &str> =
    TableDefinition::new("task_idempotency_idx");

/// Key: `task_id:created_at(zero-padded):result_id`
const RESULT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("task_results");

/// Key: `task_id:checked_at(zero-padded):check_id`
const QUALITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("quality_checks");

fn appended_key(task_id: &str, ts: i64, id: &str) -> String {
    format!("{}:{:020}:{}", task_id, ts.max(0), id)
}

/// Half-open key range spanning every appended row of one task. Appended
/// keys put `:` right after the task id, and `;` is the ASCII successor of
/// `:`, so `["{id}:", "{id};")` covers exactly that task's rows.
fn task_key_bounds(task_id: &str) -> (String, String) {
    (format!("{task_id}:"), format!("{task_id};"))
}

/// Task repository on an embedded single-file database.
#[derive(Clone)]
pub struct RedbTaskStore {
    db: Arc<Database>,
}

impl RedbTaskStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write().map_err(StoreError::backend)?;
        write_txn
            .open_table(TASK_TABLE)
            .map_err(StoreError::backend)?;
        write_txn
            .open_table(IDEMPOTENCY_INDEX)
            .map_err(StoreError::backend)?;
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(Self { db })
    }

    /// Read-modify-write one task inside a single write transaction.
    fn mutate<F>(&self, id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        let task = {
            let mut table = write_txn
                .open_table(TASK_TABLE)
                .map_err(StoreError::backend)?;
            let data = table
                .get(id)
                .map_err(StoreError::backend)?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let mut task: Task = serde_json::from_slice(&data)?;
            if task.deleted_at.is_some() {
                return Err(StoreError::NotFound(id.to_string()));
            }
            f(&mut task)?;
            let bytes = serde_json::to_vec(&task)?;
            table
                .insert(id, bytes.as_slice())
                .map_err(StoreError::backend)?;
            task
        };
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(task)
    }

    fn load_all(&self) -> Result<Vec<Task>> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = read_txn
            .open_table(TASK_TABLE)
            .map_err(StoreError::backend)?;
        let mut tasks = Vec::new();
        for entry in table.iter().map_err(StoreError::backend)? {
            let entry = entry.map_err(StoreError::backend)?;
            tasks.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(tasks)
    }
}

impl TaskStore for RedbTaskStore {
    fn create(&self, input: NewTask) -> Result<Task> {
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        let task = {
            let mut table = write_txn
                .open_table(TASK_TABLE)
                .map_err(StoreError::backend)?;
            let mut index = write_txn
                .open_table(IDEMPOTENCY_INDEX)
                .map_err(StoreError::backend)?;

            let mut replayed: Option<Task> = None;
            if let Some(key) = input.idempotency_key.as_deref()
                && let Some(existing_id) = index
                    .get(key)
                    .map_err(StoreError::backend)?
                    .map(|v| v.value().to_string())
                && let Some(data) = table.get(existing_id.as_str()).map_err(StoreError::backend)?
            {
                let existing: Task = serde_json::from_slice(data.value())?;
                if existing.deleted_at.is_none() {
                    replayed = Some(existing);
                }
            }

            match replayed {
                Some(existing) => existing,
                None => {
                    let task = Task::new(input);
                    let bytes = serde_json::to_vec(&task)?;
                    table
                        .insert(task.task_id.as_str(), bytes.as_slice())
                        .map_err(StoreError::backend)?;
                    if let Some(key) = task.idempotency_key.as_deref() {
                        index
                            .insert(key, task.task_id.as_str())
                            .map_err(StoreError::backend)?;
                    }
                    task
                }
            }
        };
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(task)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Task>> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = read_txn
            .open_table(TASK_TABLE)
            .map_err(StoreError::backend)?;
        match table.get(id).map_err(StoreError::backend)? {
            Some(data) => {
                let task: Task = serde_json::from_slice(data.value())?;
                if task.deleted_at.is_some() {
                    Ok(None)
                } else {
                    Ok(Some(task))
                }
            }
            None => Ok(None),
        }
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let index = read_txn
            .open_table(IDEMPOTENCY_INDEX)
            .map_err(StoreError::backend)?;
        let Some(task_id) = index
            .get(key)
            .map_err(StoreError::backend)?
            .map(|v| v.value().to_string())
        else {
            return Ok(None);
        };
        drop(index);
        drop(read_txn);
        self.find_by_id(&task_id)
    }

    fn list(&self, filter: &TaskFilter, page: u64, limit: u64) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .load_all()?
            .into_iter()
            .filter(|t| filter.include_deleted || t.deleted_at.is_none())
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                filter
                    .workflow_type
                    .as_deref()
                    .is_none_or(|w| t.workflow_type == w)
            })
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
        let mut tasks: Vec<Task> = self
            .load_all()?
            .into_iter()
            .filter(|t| t.deleted_at.is_none() && t.status == TaskStatus::Pending)
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
        let mut tasks: Vec<Task> = self
            .load_all()?
            .into_iter()
            .filter(|t| {
                t.deleted_at.is_none()
                    && t.status == TaskStatus::Running
                    && t.updated_at < cutoff_ms
            })
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
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = write_txn
                .open_table(TASK_TABLE)
                .map_err(StoreError::backend)?;
            let removed = table.remove(id).map_err(StoreError::backend)?;
            let Some(data) = removed else {
                return Err(StoreError::NotFound(id.to_string()));
            };
            let task: Task = serde_json::from_slice(data.value())?;
            drop(data);
            if let Some(key) = task.idempotency_key.as_deref() {
                let mut index = write_txn
                    .open_table(IDEMPOTENCY_INDEX)
                    .map_err(StoreError::backend)?;
                index.remove(key).map_err(StoreError::backend)?;
            }
        }
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for task in self.load_all()? {
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

/// Append-only result rows, prefix-keyed by task id.
#[derive(Clone)]
pub struct RedbResultStore {
    db: Arc<Database>,
}

impl RedbResultStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write().map_err(StoreError::backend)?;
        write_txn
            .open_table(RESULT_TABLE)
            .map_err(StoreError::backend)?;
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(Self { db })
    }
}

impl ResultStore for RedbResultStore {
    fn create(&self, record: &ResultRecord) -> Result<()> {
        let key = appended_key(&record.task_id, record.created_at, &record.result_id);
        let bytes = serde_json::to_vec(record)?;
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = write_txn
                .open_table(RESULT_TABLE)
                .map_err(StoreError::backend)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(StoreError::backend)?;
        }
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn find_by_task_id(&self, task_id: &str) -> Result<Vec<ResultRecord>> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = read_txn
            .open_table(RESULT_TABLE)
            .map_err(StoreError::backend)?;
        let (start, end) = task_key_bounds(task_id);
        let mut records = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(StoreError::backend)?
            .rev()
        {
            let entry = entry.map_err(StoreError::backend)?;
            records.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(records)
    }

    fn delete_by_task_id(&self, task_id: &str) -> Result<usize> {
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        let count = {
            let mut table = write_txn
                .open_table(RESULT_TABLE)
                .map_err(StoreError::backend)?;
            let (start, end) = task_key_bounds(task_id);
            let keys: Vec<String> = table
                .range(start.as_str()..end.as_str())
                .map_err(StoreError::backend)?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()
                .map_err(StoreError::backend)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(StoreError::backend)?;
            }
            keys.len()
        };
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(count)
    }
}

/// Append-only quality-check rows, prefix-keyed by task id.
#[derive(Clone)]
pub struct RedbQualityCheckStore {
    db: Arc<Database>,
}

impl RedbQualityCheckStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write().map_err(StoreError::backend)?;
        write_txn
            .open_table(QUALITY_TABLE)
            .map_err(StoreError::backend)?;
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(Self { db })
    }
}

impl QualityCheckStore for RedbQualityCheckStore {
    fn create(&self, task_id: &str, report: &QualityReport) -> Result<()> {
        let record = QualityCheckRecord::new(task_id, report.clone());
        let key = appended_key(task_id, record.report.checked_at, &record.check_id);
        let bytes = serde_json::to_vec(&record)?;
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = write_txn
                .open_table(QUALITY_TABLE)
                .map_err(StoreError::backend)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(StoreError::backend)?;
        }
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn find_by_task_id(&self, task_id: &str) -> Result<Vec<QualityCheckRecord>> {
        let read_txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = read_txn
            .open_table(QUALITY_TABLE)
            .map_err(StoreError::backend)?;
        let (start, end) = task_key_bounds(task_id);
        let mut records = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(StoreError::backend)?
            .rev()
        {
            let entry = entry.map_err(StoreError::backend)?;
            records.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(records)
    }

    fn latest(&self, task_id: &str, phase: &str) -> Result<Option<QualityCheckRecord>> {
        Ok(self
            .find_by_task_id(task_id)?
            .into_iter()
            .find(|r| r.report.phase == phase))
    }

    fn delete_by_task_id(&self, task_id: &str) -> Result<usize> {
        let write_txn = self.db.begin_write().map_err(StoreError::backend)?;
        let count = {
            let mut table = write_txn
                .open_table(QUALITY_TABLE)
                .map_err(StoreError::backend)?;
            let (start, end) = task_key_bounds(task_id);
            let keys: Vec<String> = table
                .range(start.as_str()..end.as_str())
                .map_err(StoreError::backend)?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()
                .map_err(StoreError::backend)?;
            for key in &keys {
                table.remove(key.as_str()).map_err(StoreError::backend)?;
            }
            keys.len()
        };
        write_txn.commit().map_err(StoreError::backend)?;
        Ok(count)
    }
}
