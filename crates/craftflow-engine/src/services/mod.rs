//! Contracts the external collaborators present to the core.
//!
//! The LLM chat service, the web search service and the image generation
//! service are opaque RPC endpoints. The engine only sees these traits;
//! HTTP adapters live in [`http`], deterministic test doubles in [`mock`].

pub mod http;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure modes of an external call, pre-classified for the node runtime.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    /// 5xx, timeouts, connection errors, rate limits. Worth retrying.
    #[error("transient service failure: {0}")]
    Transient(String),

    /// Non-retryable rejection (4xx other than 408/429).
    #[error("permanent service failure: {0}")]
    Permanent(String),

    #[error("service call cancelled")]
    Cancelled,
}

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub tokens_used: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub url: String,
    pub prompt: String,
    pub size: String,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, ServiceError>;

    /// Model identifier recorded in quality reports.
    fn model_name(&self) -> String;
}

#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, ServiceError>;
}

#[async_trait]
pub trait ImageService: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        size: &str,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedImage>, ServiceError>;
}

/// Process-wide bundle of external service handles, created at startup and
/// passed as a dependency. No global mutable state.
#[derive(Clone)]
pub struct Services {
    pub llm: Arc<dyn LlmService>,
    pub search: Arc<dyn SearchService>,
    pub image: Arc<dyn ImageService>,
}

impl Services {
    pub fn new(
        llm: Arc<dyn LlmService>,
        search: Arc<dyn SearchService>,
        image: Arc<dyn ImageService>,
    ) -> Self {
        Self { llm, search, image }
    }
}
