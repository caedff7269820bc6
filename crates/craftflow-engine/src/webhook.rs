//! Webhook notifier: at-least-once delivery with bounded backoff.
//!
//! Delivery outcome never affects the task's lifecycle; receivers must
//! deduplicate on `(taskId, event)`.

use std::time::Duration;

use craftflow_models::{
    CallbackEvent, ErrorKind, Task, WebhookError, WebhookPayload, WebhookResult,
};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_TASK_ID: &str = "X-Task-Id";

pub struct WebhookNotifier {
    client: reqwest::Client,
    retries: u32,
    backoff: Duration,
}

impl WebhookNotifier {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            retries,
            backoff,
        }
    }

    /// Notify a terminal `completed` transition.
    pub async fn notify_completed(&self, task: &Task, content: Option<String>, metrics: Value) {
        let payload = WebhookPayload::new(task, CallbackEvent::Completed, self.metadata(task))
            .with_result(WebhookResult {
                content: content.unwrap_or_default(),
                metrics,
            });
        self.notify(task, CallbackEvent::Completed, payload).await;
    }

    /// Notify a terminal `failed` transition.
    pub async fn notify_failed(&self, task: &Task, kind: ErrorKind, message: String) {
        let payload = WebhookPayload::new(task, CallbackEvent::Failed, self.metadata(task))
            .with_error(WebhookError {
                message,
                kind,
                details: Value::Object(Default::default()),
            });
        self.notify(task, CallbackEvent::Failed, payload).await;
    }

    /// Notify a progress update, sent by the graph engine after each
    /// completed node.
    pub async fn notify_progress(&self, task: &Task) {
        let mut metadata = self.metadata(task);
        if let (Value::Object(map), Some(step)) = (&mut metadata, task.current_step.as_deref()) {
            map.insert(
                "currentStep".to_string(),
                Value::String(step.to_string()),
            );
        }
        let payload = WebhookPayload::new(task, CallbackEvent::Progress, metadata);
        self.notify(task, CallbackEvent::Progress, payload).await;
    }

    fn metadata(&self, task: &Task) -> Value {
        // The workflow records display metadata (topic, language pair, ...)
        // in the snapshot's base; surface it when available.
        task.state_snapshot
            .as_ref()
            .and_then(|s| s.get("base"))
            .and_then(|b| b.get("metadata"))
            .cloned()
            .unwrap_or(Value::Object(Default::default()))
    }

    /// Filtered send. No-op unless the task subscribed to `event`.
    pub async fn notify(&self, task: &Task, event: CallbackEvent, payload: WebhookPayload) {
        if !task.wants_callback(event) {
            debug!(task_id = %task.task_id, event = %event, "Webhook filtered out");
            return;
        }
        let Some(url) = task.callback_url.as_deref() else {
            return;
        };
        match self.deliver(url, &task.task_id, event, &payload).await {
            Ok(attempts) => {
                info!(task_id = %task.task_id, event = %event, attempts, "Webhook delivered")
            }
            Err(e) => {
                warn!(task_id = %task.task_id, event = %event, error = %e, "Webhook delivery gave up")
            }
        }
    }

    /// POST with up to `retries` re-sends on non-2xx or transport errors.
    /// Returns the number of attempts used.
    async fn deliver(
        &self,
        url: &str,
        task_id: &str,
        event: CallbackEvent,
        payload: &WebhookPayload,
    ) -> Result<u32, String> {
        let max_attempts = self.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = self
                .client
                .post(url)
                .header(HEADER_EVENT, event.to_string())
                .header(HEADER_TASK_ID, task_id)
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(attempt),
                Ok(response) => {
                    last_error = format!("receiver returned {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            warn!(
                task_id = %task_id,
                event = %event,
                attempt,
                max_attempts,
                error = %last_error,
                "Webhook attempt failed"
            );

            if attempt < max_attempts {
                let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_error)
    }
}
