//! Node runtime: validate → execute → retry → timeout.
//!
//! Wraps every node invocation with a per-attempt timeout, intra-node retry
//! with jittered exponential backoff for transient failures, and start /
//! finish observations. Validation errors are surfaced immediately.

use std::time::{Duration, Instant};

use craftflow_models::{StatePatch, WorkflowState};
use rand::Rng;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::node::{NodeContext, WorkflowNode};

const BACKOFF_START_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;
/// Jitter range as a fraction of the delay.
const JITTER_MIN: f64 = 0.10;
const JITTER_MAX: f64 = 0.25;

/// Backoff for `attempt` (zero-based), jittered.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_START_MS.saturating_mul(1u64 << attempt.min(16)) as f64;
    let capped = base.min(BACKOFF_CAP_MS as f64);
    let jitter = rand::rng().random_range(JITTER_MIN..JITTER_MAX);
    Duration::from_millis((capped * (1.0 + jitter)) as u64)
}

/// Run one node to a final outcome.
///
/// `deadline` is the whole-task budget; each attempt's timeout is clipped to
/// the time remaining so a task-level timeout is observed at the next node
/// boundary at the latest.
pub async fn run_node(
    node: &dyn WorkflowNode,
    state: &WorkflowState,
    ctx: &NodeContext,
    deadline: Instant,
) -> Result<StatePatch, NodeError> {
    node.validate(state)?;

    let max_attempts = node.retry_count() + 1;
    let mut last_error = NodeError::Internal("node produced no outcome".to_string());

    for attempt in 0..max_attempts {
        if ctx.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(NodeError::Transient("task deadline exhausted".to_string()));
        }
        let attempt_timeout = node.timeout().min(remaining);

        let started = Instant::now();
        debug!(node = node.name(), attempt, "Node attempt started");

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(NodeError::Cancelled),
            result = tokio::time::timeout(attempt_timeout, node.execute(state, ctx)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(NodeError::Timeout {
                        node: node.name().to_string(),
                        timeout_ms: attempt_timeout.as_millis() as u64,
                    }),
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(patch) => {
                debug!(node = node.name(), attempt, duration_ms, "Node attempt succeeded");
                return Ok(patch);
            }
            Err(error) => {
                warn!(
                    node = node.name(),
                    attempt,
                    duration_ms,
                    kind = %error.kind(),
                    error = %error,
                    "Node attempt failed"
                );
                if !error.is_retryable() {
                    return Err(error);
                }
                last_error = error;
            }
        }

        if attempt + 1 < max_attempts {
            let delay = backoff_delay(attempt);
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    // Retry budget exhausted. A final timeout bubbles as a transient
    // external failure so the graph-level policy applies uniformly.
    Err(match last_error {
        NodeError::Timeout { node, timeout_ms } => NodeError::Transient(format!(
            "node {node} exhausted retries; last attempt timed out after {timeout_ms}ms"
        )),
        other => other,
    })
}
