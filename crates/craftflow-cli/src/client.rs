//! Thin HTTP client over the server's JSON API.
//!
//! Unwraps the `{success, data | error, timestamp}` envelope: errors from
//! the server become CLI errors (exit code 1).

use anyhow::{Result, bail};
use serde_json::{Value, json};

pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn unwrap_envelope(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => bail!("server returned an unreadable response ({status}): {e}"),
        };
        if body["success"].as_bool() == Some(true) {
            Ok(body["data"].clone())
        } else {
            let message = body["error"].as_str().unwrap_or("unknown error");
            bail!("{message} ({status})")
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        workflow: &str,
        mode: &str,
        params: Value,
        idempotency_key: Option<String>,
        callback_url: Option<String>,
        callback_events: Option<String>,
        priority: i32,
    ) -> Result<Value> {
        let events: Vec<String> = callback_events
            .as_deref()
            .map(|raw| raw.split(',').map(|e| e.trim().to_string()).collect())
            .unwrap_or_default();
        let body = json!({
            "workflowType": workflow,
            "mode": mode,
            "params": params,
            "idempotencyKey": idempotency_key,
            "callbackUrl": callback_url,
            "callbackEvents": events,
            "priority": priority,
        });
        let response = self
            .client
            .post(format!("{}/api/tasks", self.base_url))
            .json(&body)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn task_status(&self, task_id: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/api/tasks/{}/status", self.base_url, task_id))
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn task_result(&self, task_id: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/api/tasks/{}/result", self.base_url, task_id))
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<Value> {
        let response = self
            .client
            .delete(format!("{}/api/tasks/{}", self.base_url, task_id))
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn list(&self, status: Option<&str>, page: u64, limit: u64) -> Result<Value> {
        let mut url = format!("{}/api/tasks?page={page}&limit={limit}", self.base_url);
        if let Some(status) = status {
            url.push_str(&format!("&status={status}"));
        }
        let response = self.client.get(url).send().await?;
        Self::unwrap_envelope(response).await
    }

    pub async fn workflows(&self) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/api/workflows", self.base_url))
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }
}
