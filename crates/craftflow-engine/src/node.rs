//! The single-node contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use craftflow_models::{StatePatch, WorkflowState};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::NodeError;
use crate::services::Services;

/// Everything a node may touch besides the state it is handed.
#[derive(Clone)]
pub struct NodeContext {
    pub services: Services,
    pub cancel: CancellationToken,
    pub config: Arc<EngineConfig>,
}

impl NodeContext {
    pub fn new(services: Services, cancel: CancellationToken, config: Arc<EngineConfig>) -> Self {
        Self {
            services,
            cancel,
            config,
        }
    }
}

/// A unit of work within a workflow graph.
///
/// Nodes never mutate the state they are given; they return a patch the
/// engine merges. `execute` must be idempotent under re-execution: a crash
/// between a node's success and the next checkpoint re-runs it.
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    /// Unique within a graph.
    fn name(&self) -> &str;

    /// Intra-node retry budget for transient failures.
    fn retry_count(&self) -> u32 {
        2
    }

    /// Per-attempt wall-clock limit.
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Deterministic precondition check. Failures are never retried.
    fn validate(&self, _state: &WorkflowState) -> Result<(), NodeError> {
        Ok(())
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError>;
}

/// Append `step` to the `stepsCompleted` list carried in the payload.
///
/// Shared by nodes that report pipeline progress in their patch.
pub fn push_step(state: &WorkflowState, patch: &mut StatePatch, step: &str) {
    let mut steps: Vec<String> = state
        .data
        .get("stepsCompleted")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    if steps.last().map(String::as_str) != Some(step) {
        steps.push(step.to_string());
    }
    patch.insert(
        "stepsCompleted".to_string(),
        serde_json::to_value(steps).unwrap_or_default(),
    );
}
