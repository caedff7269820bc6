//! Dispatcher: feeds pending tasks from the store into the queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use craftflow_storage::Storage;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::queue::{QueueEnvelope, TaskQueue};

pub struct Dispatcher {
    storage: Arc<Storage>,
    queue: Arc<TaskQueue>,
    /// Tasks already handed to the queue and not yet finished, so a later
    /// tick does not enqueue them twice.
    inflight: Mutex<HashSet<String>>,
    batch_size: usize,
}

impl Dispatcher {
    pub fn new(storage: Arc<Storage>, queue: Arc<TaskQueue>) -> Self {
        Self {
            storage,
            queue,
            inflight: Mutex::new(HashSet::new()),
            batch_size: 50,
        }
    }

    /// One scan: enqueue pending tasks not yet in flight. Returns how many
    /// were enqueued.
    pub fn tick(&self) -> usize {
        let pending = match self.storage.tasks.get_pending_tasks(self.batch_size) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Dispatcher failed to read pending tasks");
                return 0;
            }
        };

        let mut enqueued = 0;
        let mut inflight = self.inflight.lock();
        for task in pending {
            if inflight.contains(&task.task_id) {
                continue;
            }
            inflight.insert(task.task_id.clone());
            self.queue.enqueue(QueueEnvelope::new(
                &task.task_id,
                &task.workflow_type,
                task.priority,
            ));
            enqueued += 1;
        }
        if enqueued > 0 {
            debug!(enqueued, "Dispatcher enqueued pending tasks");
        }
        enqueued
    }

    /// Called by workers once a task has left their hands (terminal, skipped
    /// or reclaimed) so the dispatcher may pick it up again if it returns to
    /// `pending`.
    pub fn mark_done(&self, task_id: &str) {
        self.inflight.lock().remove(task_id);
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Periodic scan loop until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_ms = interval.as_millis() as u64, "Dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.tick();
                }
            }
        }
        info!("Dispatcher stopped");
    }
}
