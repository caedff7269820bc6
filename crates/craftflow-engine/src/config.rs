//! Engine configuration surface.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_worker_count() -> usize {
    2
}
fn default_queue_poll_ms() -> u64 {
    100
}
fn default_dispatcher_interval_ms() -> u64 {
    1_000
}
fn default_lease_ttl_ms() -> u64 {
    300_000
}
fn default_sync_task_timeout_ms() -> u64 {
    300_000
}
fn default_async_task_timeout_ms() -> u64 {
    1_800_000
}
fn default_retry_budget() -> u32 {
    3
}
fn default_quality_threshold() -> f64 {
    7.0
}
fn default_webhook_retries() -> u32 {
    3
}
fn default_webhook_backoff_ms() -> u64 {
    5_000
}
fn default_image_eval_parallelism() -> usize {
    4
}
fn default_cancel_grace_ms() -> u64 {
    5_000
}

/// Tunables for the engine, worker pool and notifier.
///
/// Serde-loadable so binaries can read it from a config file and override
/// individual fields from flags or the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub queue_poll_ms: u64,
    pub dispatcher_interval_ms: u64,
    pub lease_ttl_ms: u64,
    pub sync_task_timeout_ms: u64,
    pub async_task_timeout_ms: u64,
    /// Per-class quality retry budgets; classes not listed use `default_retry_budget`.
    pub retry_budgets: BTreeMap<String, u32>,
    pub default_retry_budget: u32,
    pub quality_threshold: f64,
    pub webhook_retries: u32,
    pub webhook_backoff_ms: u64,
    pub image_eval_parallelism: usize,
    pub cancel_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_poll_ms: default_queue_poll_ms(),
            dispatcher_interval_ms: default_dispatcher_interval_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            sync_task_timeout_ms: default_sync_task_timeout_ms(),
            async_task_timeout_ms: default_async_task_timeout_ms(),
            retry_budgets: BTreeMap::new(),
            default_retry_budget: default_retry_budget(),
            quality_threshold: default_quality_threshold(),
            webhook_retries: default_webhook_retries(),
            webhook_backoff_ms: default_webhook_backoff_ms(),
            image_eval_parallelism: default_image_eval_parallelism(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

impl EngineConfig {
    pub fn retry_budget(&self, class: &str) -> u32 {
        self.retry_budgets
            .get(class)
            .copied()
            .unwrap_or(self.default_retry_budget)
    }

    pub fn sync_task_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_task_timeout_ms)
    }

    pub fn async_task_timeout(&self) -> Duration {
        Duration::from_millis(self.async_task_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
