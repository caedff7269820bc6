//! HTTP adapters shaping real endpoints to the core service contracts.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ChatCompletion, ChatRequest, GeneratedImage, ImageService, LlmService, SearchHit,
    SearchService, ServiceError,
};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Connection settings for one upstream endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_ms: u64,
}

impl EndpointConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

fn build_client(timeout_ms: u64) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| ServiceError::Permanent(format!("failed to build HTTP client: {e}")))
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> ServiceError {
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        ServiceError::Transient(format!("upstream returned {status}: {body}"))
    } else {
        ServiceError::Permanent(format!("upstream returned {status}: {body}"))
    }
}

fn classify_transport(err: reqwest::Error) -> ServiceError {
    // Timeouts and connection failures are worth retrying; anything else
    // (body decode, builder misuse) is not.
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ServiceError::Transient(err.to_string())
    } else {
        ServiceError::Permanent(err.to_string())
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: serde_json::Value,
    cancel: &CancellationToken,
) -> Result<serde_json::Value, ServiceError> {
    let mut request = client.post(url).json(&body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
        response = request.send() => response.map_err(classify_transport)?,
    };

    let status = response.status();
    let text = response.text().await.map_err(classify_transport)?;
    if !status.is_success() {
        return Err(classify_status(status, &text));
    }
    serde_json::from_str(&text)
        .map_err(|e| ServiceError::Permanent(format!("unparseable upstream response: {e}")))
}

/// OpenAI-compatible chat completion endpoint.
pub struct HttpLlmService {
    config: EndpointConfig,
    client: reqwest::Client,
}

impl HttpLlmService {
    pub fn new(config: EndpointConfig) -> Result<Self, ServiceError> {
        let client = build_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[async_trait]
impl LlmService for HttpLlmService {
    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, ServiceError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = json!({
            "model": self.config.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        debug!(url = %url, messages = request.messages.len(), "LLM chat call");
        let value = post_json(
            &self.client,
            &url,
            self.config.api_key.as_deref(),
            body,
            cancel,
        )
        .await?;

        let parsed: ChatResponse = serde_json::from_value(value)
            .map_err(|e| ServiceError::Permanent(format!("malformed chat response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ServiceError::Permanent("chat response had no choices".to_string()))?;

        Ok(ChatCompletion {
            content,
            model: parsed.model.unwrap_or_else(|| self.model_name()),
            tokens_used: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }

    fn model_name(&self) -> String {
        self.config.model.clone().unwrap_or_default()
    }
}

/// Generic JSON search endpoint: `POST {base}/search {query, limit}`.
pub struct HttpSearchService {
    config: EndpointConfig,
    client: reqwest::Client,
}

impl HttpSearchService {
    pub fn new(config: EndpointConfig) -> Result<Self, ServiceError> {
        let client = build_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

#[async_trait]
impl SearchService for HttpSearchService {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        let url = format!("{}/search", self.config.base_url);
        let value = post_json(
            &self.client,
            &url,
            self.config.api_key.as_deref(),
            json!({"query": query, "limit": limit}),
            cancel,
        )
        .await?;
        let parsed: SearchResponse = serde_json::from_value(value)
            .map_err(|e| ServiceError::Permanent(format!("malformed search response: {e}")))?;
        Ok(parsed.results)
    }
}

/// Image generation endpoint: `POST {base}/images {prompt, size, n}`.
pub struct HttpImageService {
    config: EndpointConfig,
    client: reqwest::Client,
}

impl HttpImageService {
    pub fn new(config: EndpointConfig) -> Result<Self, ServiceError> {
        let client = build_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }
}

#[derive(Deserialize)]
struct ImageDatum {
    url: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[async_trait]
impl ImageService for HttpImageService {
    async fn generate(
        &self,
        prompt: &str,
        size: &str,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedImage>, ServiceError> {
        let url = format!("{}/images", self.config.base_url);
        let value = post_json(
            &self.client,
            &url,
            self.config.api_key.as_deref(),
            json!({"prompt": prompt, "size": size, "n": count}),
            cancel,
        )
        .await?;
        let parsed: ImageResponse = serde_json::from_value(value)
            .map_err(|e| ServiceError::Permanent(format!("malformed image response: {e}")))?;
        Ok(parsed
            .data
            .into_iter()
            .map(|d| GeneratedImage {
                url: d.url,
                prompt: prompt.to_string(),
                size: size.to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, ""),
            ServiceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            ServiceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_REQUEST, ""),
            ServiceError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::UNAUTHORIZED, ""),
            ServiceError::Permanent(_)
        ));
    }
}
