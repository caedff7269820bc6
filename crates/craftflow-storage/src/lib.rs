//! Durable storage for the Craftflow engine.
//!
//! The [`Storage`] facade bundles the task repository, the append-only
//! result and quality-check repositories and the checkpoint manager behind
//! one handle. Two backends satisfy the same contracts: an embedded
//! single-file redb database for production and an in-memory map for tests.

pub mod checkpoint;
pub mod error;
pub mod memory_store;
pub mod redb_store;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use redb::Database;
use tracing::info;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use error::{Result, StoreError};
pub use memory_store::{MemoryQualityCheckStore, MemoryResultStore, MemoryTaskStore};
pub use redb_store::{RedbQualityCheckStore, RedbResultStore, RedbTaskStore};
pub use store::{
    QualityCheckRecord, QualityCheckStore, ResultStore, StoreStats, TaskFilter, TaskStore,
};

/// Process-wide storage handle.
pub struct Storage {
    pub tasks: Arc<dyn TaskStore>,
    pub results: Arc<dyn ResultStore>,
    pub quality: Arc<dyn QualityCheckStore>,
    pub checkpoints: CheckpointManager,
}

impl Storage {
    /// Open (or create) the embedded database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Arc::new(Database::create(path.as_ref()).map_err(StoreError::backend)?);
        info!(path = %path.as_ref().display(), "Opened task database");
        Self::from_db(db)
    }

    /// Build over an already-open redb handle (tests, embedded setups).
    pub fn from_db(db: Arc<Database>) -> Result<Self> {
        let tasks: Arc<dyn TaskStore> = Arc::new(RedbTaskStore::new(db.clone())?);
        let results: Arc<dyn ResultStore> = Arc::new(RedbResultStore::new(db.clone())?);
        let quality: Arc<dyn QualityCheckStore> = Arc::new(RedbQualityCheckStore::new(db)?);
        let checkpoints = CheckpointManager::new(tasks.clone());
        Ok(Self {
            tasks,
            results,
            quality,
            checkpoints,
        })
    }

    /// Fully in-memory storage with identical semantics.
    pub fn in_memory() -> Self {
        let tasks: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let results: Arc<dyn ResultStore> = Arc::new(MemoryResultStore::new());
        let quality: Arc<dyn QualityCheckStore> = Arc::new(MemoryQualityCheckStore::new());
        let checkpoints = CheckpointManager::new(tasks.clone());
        Self {
            tasks,
            results,
            quality,
            checkpoints,
        }
    }

    /// Hard-delete a task and its dependents in one logical unit.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.tasks.delete(task_id)?;
        self.results.delete_by_task_id(task_id)?;
        self.quality.delete_by_task_id(task_id)?;
        self.checkpoints.forget(task_id);
        Ok(())
    }

    /// Storage health probe for the `/health` endpoint.
    pub fn ping(&self) -> bool {
        self.tasks.stats().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craftflow_models::{NewTask, QualityReport, ResultRecord, TaskMode};

    fn backends() -> (Vec<Storage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        (
            vec![Storage::open(path).unwrap(), Storage::in_memory()],
            dir,
        )
    }

    fn new_input() -> NewTask {
        NewTask {
            workflow_type: "content-creator".to_string(),
            mode: TaskMode::Sync,
            priority: 0,
            idempotency_key: None,
            callback_url: None,
            callback_events: vec![],
            typed_inputs: serde_json::json!({}),
        }
    }

    #[test]
    fn delete_cascades_to_dependents() {
        let (backends, _dir) = backends();
        for storage in backends {
            let task = storage.tasks.create(new_input()).unwrap();
            storage
                .results
                .create(&ResultRecord::inline(&task.task_id, "article", "body"))
                .unwrap();
            storage
                .quality
                .create(&task.task_id, &QualityReport::empty_pass("text", "v1"))
                .unwrap();

            storage.delete_task(&task.task_id).unwrap();
            assert!(storage.tasks.find_by_id(&task.task_id).unwrap().is_none());
            assert!(
                storage
                    .results
                    .find_by_task_id(&task.task_id)
                    .unwrap()
                    .is_empty()
            );
            assert!(
                storage
                    .quality
                    .find_by_task_id(&task.task_id)
                    .unwrap()
                    .is_empty()
            );
        }
    }

    #[test]
    fn ping_reports_healthy() {
        let (backends, _dir) = backends();
        for storage in backends {
            assert!(storage.ping());
        }
    }
}
