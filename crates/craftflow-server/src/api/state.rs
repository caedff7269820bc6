//! Shared handler state.

use std::sync::Arc;

use craftflow_engine::{CancelRegistry, SyncExecutor, TaskQueue, WorkflowRegistry};
use craftflow_storage::Storage;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub registry: Arc<WorkflowRegistry>,
    pub executor: Arc<SyncExecutor>,
    pub queue: Arc<TaskQueue>,
    pub cancellations: Arc<CancelRegistry>,
    /// Whether a worker pool drains the queue in this deployment.
    pub async_enabled: bool,
    /// Parent token for request-scoped executions; cancelled on shutdown.
    pub server_cancel: CancellationToken,
}
