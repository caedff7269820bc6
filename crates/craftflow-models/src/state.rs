//! In-flight workflow state.
//!
//! The engine drives a [`WorkflowState`]: a strongly-typed base every
//! workflow shares, plus an opaque JSON payload only the owning workflow
//! understands. Nodes return patches against the payload; the engine merges
//! them and never reaches into workflow-specific fields.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::{Task, TaskMode};
use crate::time::now_ms;

/// Fields the engine itself reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateBase {
    pub task_id: String,
    pub workflow_type: String,
    pub mode: TaskMode,
    pub current_step: Option<String>,
    /// Per-class quality-retry counters, mirrored to the task row.
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    /// Bumped once per executed node.
    pub version: u64,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A partial update to the workflow payload, produced by a node.
pub type StatePatch = Map<String, Value>;

/// The working set of a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub base: StateBase,
    /// Workflow-specific payload. Opaque to the engine.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl WorkflowState {
    /// Fresh state for a task, with an empty payload.
    pub fn for_task(task: &Task) -> Self {
        Self {
            base: StateBase {
                task_id: task.task_id.clone(),
                workflow_type: task.workflow_type.clone(),
                mode: task.mode,
                current_step: None,
                retry_counts: BTreeMap::new(),
                version: 0,
                start_time: now_ms(),
                end_time: None,
                error: None,
                metadata: Map::new(),
            },
            data: Map::new(),
        }
    }

    /// Shallow-merge a node's patch into the payload.
    pub fn apply_patch(&mut self, patch: StatePatch) {
        for (key, value) in patch {
            self.data.insert(key, value);
        }
    }

    /// Deserialize the payload into a workflow's typed view.
    pub fn data_view<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }

    /// Serialize a typed view back into a payload map.
    pub fn data_from<T: Serialize>(view: &T) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(view)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::de::Error::custom(format!(
                "workflow data must serialize to an object, got {other}"
            ))),
        }
    }

    pub fn retry_count(&self, class: &str) -> u32 {
        self.base.retry_counts.get(class).copied().unwrap_or(0)
    }

    /// Increment a retry-class counter, returning the new value.
    pub fn bump_retry(&mut self, class: &str) -> u32 {
        let counter = self.base.retry_counts.entry(class.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// The durable checkpoint projection of this state.
    pub fn to_snapshot(&self) -> Value {
        // Serialization of Self cannot fail: all fields are JSON values.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_snapshot(snapshot: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(snapshot.clone())
    }
}
