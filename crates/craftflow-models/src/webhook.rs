//! Webhook payload contract. Fixed shape, append-only fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::task::{CallbackEvent, Task, TaskStatus};
use crate::time::now_rfc3339;

/// Delivered on `completed` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResult {
    pub content: String,
    /// Free-form metrics: `tokensUsed`, `duration`, ...
    #[serde(default)]
    pub metrics: Value,
}

/// Delivered on `failed` events. Never carries stack traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(default)]
    pub details: Value,
}

/// The POST body sent to `callbackUrl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: CallbackEvent,
    pub task_id: String,
    pub status: TaskStatus,
    /// ISO-8601 delivery timestamp.
    pub timestamp: String,
    pub workflow_type: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<WebhookResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WebhookError>,
}

impl WebhookPayload {
    pub fn new(task: &Task, event: CallbackEvent, metadata: Value) -> Self {
        Self {
            event,
            task_id: task.task_id.clone(),
            status: task.status,
            timestamp: now_rfc3339(),
            workflow_type: task.workflow_type.clone(),
            metadata,
            result: None,
            error: None,
        }
    }

    pub fn with_result(mut self, result: WebhookResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: WebhookError) -> Self {
        self.error = Some(error);
        self
    }
}
