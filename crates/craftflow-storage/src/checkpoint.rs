//! Checkpoint manager: the latest known workflow state of a task.
//!
//! Thin layer over the task store's snapshot column with a best-effort
//! in-process cache. Losing the cache is never a correctness bug; the store
//! copy is canonical.

use std::collections::HashMap;
use std::sync::Arc;

use craftflow_models::WorkflowState;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::store::TaskStore;

/// A materialized checkpoint of one task.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub task_id: String,
    pub step_name: String,
    pub snapshot: Value,
}

pub struct CheckpointManager {
    tasks: Arc<dyn TaskStore>,
    cache: Mutex<HashMap<String, Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            tasks,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Persist the checkpoint projection of `state` after `step_name`.
    ///
    /// Returns the new task version, or `None` when the write lost a version
    /// race; the caller decides whether that matters.
    pub fn save(
        &self,
        task_id: &str,
        step_name: &str,
        state: &WorkflowState,
    ) -> Result<Option<u64>> {
        let task = self
            .tasks
            .find_by_id(task_id)?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        let snapshot = state.to_snapshot();
        match self.tasks.save_state_snapshot(task_id, &snapshot, task.version) {
            Ok(updated) => {
                self.cache.lock().insert(
                    task_id.to_string(),
                    Checkpoint {
                        task_id: task_id.to_string(),
                        step_name: step_name.to_string(),
                        snapshot,
                    },
                );
                debug!(task_id = %task_id, step = %step_name, version = updated.version, "Checkpoint saved");
                Ok(Some(updated.version))
            }
            Err(StoreError::VersionConflict(_)) => {
                warn!(task_id = %task_id, step = %step_name, "Checkpoint lost version race");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Load the latest checkpoint, cache first.
    ///
    /// A checkpoint is only returned when it is minimally valid: non-empty
    /// snapshot whose workflow type matches the task's.
    pub fn load(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        if let Some(cached) = self.cache.lock().get(task_id).cloned() {
            return Ok(Some(cached));
        }

        let Some(task) = self.tasks.find_by_id(task_id)? else {
            return Ok(None);
        };
        let Some(snapshot) = task.state_snapshot else {
            return Ok(None);
        };

        let state = match WorkflowState::from_snapshot(&snapshot) {
            Ok(state) => state,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Discarding unreadable checkpoint");
                return Ok(None);
            }
        };
        if state.base.workflow_type != task.workflow_type {
            warn!(
                task_id = %task_id,
                snapshot_type = %state.base.workflow_type,
                task_type = %task.workflow_type,
                "Discarding checkpoint for mismatched workflow type"
            );
            return Ok(None);
        }
        let Some(step_name) = state.base.current_step.clone() else {
            return Ok(None);
        };

        let checkpoint = Checkpoint {
            task_id: task_id.to_string(),
            step_name,
            snapshot,
        };
        self.cache
            .lock()
            .insert(task_id.to_string(), checkpoint.clone());
        Ok(Some(checkpoint))
    }

    /// Reconstruct a resumable state: the checkpoint merged over
    /// `initial_state`, with the immutable inputs always taken from
    /// `initial_state`.
    ///
    /// `immutable_keys` names the workflow-specific original request fields
    /// (topic, requirements, ...) that a checkpoint must never override.
    pub fn restore(
        &self,
        task_id: &str,
        initial_state: &WorkflowState,
        immutable_keys: &[&str],
    ) -> Result<Option<WorkflowState>> {
        let Some(checkpoint) = self.load(task_id)? else {
            return Ok(None);
        };
        let mut restored = match WorkflowState::from_snapshot(&checkpoint.snapshot) {
            Ok(state) => state,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Checkpoint snapshot unreadable on restore");
                return Ok(None);
            }
        };

        // Identity always comes from the freshly built state.
        restored.base.task_id = initial_state.base.task_id.clone();
        restored.base.workflow_type = initial_state.base.workflow_type.clone();
        restored.base.mode = initial_state.base.mode;
        restored.base.start_time = initial_state.base.start_time;

        for key in immutable_keys {
            match initial_state.data.get(*key) {
                Some(value) => {
                    restored.data.insert((*key).to_string(), value.clone());
                }
                None => {
                    restored.data.remove(*key);
                }
            }
        }
        Ok(Some(restored))
    }

    /// Drop the cache entry. Persisted snapshots are untouched.
    pub fn forget(&self, task_id: &str) {
        self.cache.lock().remove(task_id);
    }

    /// Drop the whole cache (shutdown teardown).
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}
