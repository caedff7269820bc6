//! In-process task queue for the async path.
//!
//! Holds only task identifiers plus a small envelope; the store remains the
//! canonical home of task state. The queue is a best-effort accelerator: if
//! it is never drained (no worker pool), tasks simply stay `pending`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use craftflow_models::now_ms;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEnvelope {
    pub task_id: String,
    pub workflow_type: String,
    pub priority: i32,
    pub enqueued_at: i64,
}

impl QueueEnvelope {
    pub fn new(task_id: &str, workflow_type: &str, priority: i32) -> Self {
        Self {
            task_id: task_id.to_string(),
            workflow_type: workflow_type.to_string(),
            priority,
            enqueued_at: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub depth: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
}

#[derive(Default)]
pub struct TaskQueue {
    entries: Mutex<VecDeque<QueueEnvelope>>,
    notify: Notify,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, envelope: QueueEnvelope) {
        self.entries.lock().push_back(envelope);
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn try_dequeue(&self) -> Option<QueueEnvelope> {
        let envelope = self.entries.lock().pop_front();
        if envelope.is_some() {
            self.dequeued.fetch_add(1, Ordering::SeqCst);
        }
        envelope
    }

    /// Wait until something is (probably) available.
    pub async fn wait_for_task(&self) {
        self.notify.notified().await
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            enqueued_total: self.enqueued.load(Ordering::SeqCst),
            dequeued_total: self.dequeued.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = TaskQueue::new();
        queue.enqueue(QueueEnvelope::new("t-1", "content-creator", 0));
        queue.enqueue(QueueEnvelope::new("t-2", "content-creator", 0));

        assert_eq!(queue.try_dequeue().unwrap().task_id, "t-1");
        assert_eq!(queue.try_dequeue().unwrap().task_id, "t-2");
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn stats_track_totals() {
        let queue = TaskQueue::new();
        queue.enqueue(QueueEnvelope::new("t-1", "translation", 0));
        queue.enqueue(QueueEnvelope::new("t-2", "translation", 0));
        queue.try_dequeue();

        let stats = queue.stats();
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.enqueued_total, 2);
        assert_eq!(stats.dequeued_total, 1);
    }

    #[tokio::test]
    async fn enqueue_wakes_waiter() {
        let queue = std::sync::Arc::new(TaskQueue::new());
        let waiter = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = waiter.wait_for_task() => true,
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => false,
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.enqueue(QueueEnvelope::new("t-1", "translation", 0));
        assert!(handle.await.unwrap());
    }
}
