//! Lease supervisor: reclaims tasks whose worker died mid-run.
//!
//! A crashed worker leaves its task `running` with a stale lease. Tasks
//! whose `updated_at` is older than the lease TTL are returned to `pending`
//! and picked up on the next dispatcher tick, resuming from their last
//! checkpoint.

use std::sync::Arc;
use std::time::Duration;

use craftflow_models::now_ms;
use craftflow_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SCAN_BATCH: usize = 50;

pub struct LeaseSupervisor {
    storage: Arc<Storage>,
    lease_ttl: Duration,
}

impl LeaseSupervisor {
    pub fn new(storage: Arc<Storage>, lease_ttl: Duration) -> Self {
        Self { storage, lease_ttl }
    }

    /// One scan. Returns the number of reclaimed tasks.
    pub fn tick(&self) -> usize {
        let cutoff = now_ms() - self.lease_ttl.as_millis() as i64;
        let stale = match self.storage.tasks.get_stale_running(cutoff, SCAN_BATCH) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Lease scan failed");
                return 0;
            }
        };

        let mut reclaimed = 0;
        for task in stale {
            let Some(worker_id) = task.worker_id.clone() else {
                warn!(task_id = %task.task_id, "Running task has no lease holder, skipping");
                continue;
            };
            match self
                .storage
                .tasks
                .release_worker(&task.task_id, &worker_id, task.version)
            {
                Ok(_) => {
                    info!(
                        task_id = %task.task_id,
                        stale_worker = %worker_id,
                        idle_ms = now_ms() - task.updated_at,
                        "Reclaimed stale lease"
                    );
                    reclaimed += 1;
                }
                Err(e) => {
                    // The worker touched the task between our read and the
                    // release; it is alive after all.
                    warn!(task_id = %task.task_id, error = %e, "Lease reclaim lost a race");
                }
            }
        }
        reclaimed
    }

    /// Periodic scan loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = (self.lease_ttl / 4).max(Duration::from_secs(1));
        info!(
            lease_ttl_ms = self.lease_ttl.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Lease supervisor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.tick();
                }
            }
        }
        info!("Lease supervisor stopped");
    }
}
