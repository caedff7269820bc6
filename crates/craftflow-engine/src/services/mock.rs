//! Deterministic service doubles for tests.
//!
//! Testability comes from injecting these through [`super::Services`];
//! nodes never sniff the environment.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    ChatCompletion, ChatRequest, GeneratedImage, ImageService, LlmService, SearchHit,
    SearchService, ServiceError,
};

type LlmHandler =
    dyn Fn(usize, &ChatRequest) -> Result<String, ServiceError> + Send + Sync + 'static;

/// Scriptable LLM double. Records every request it sees.
pub struct MockLlm {
    handler: Box<LlmHandler>,
    calls: Mutex<Vec<ChatRequest>>,
    model: String,
}

impl MockLlm {
    /// Echoes the last user message back. Enough for plumbing tests.
    pub fn new() -> Self {
        Self::with_handler(|_, request| {
            Ok(request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default())
        })
    }

    /// Respond from a closure receiving the zero-based call index.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(usize, &ChatRequest) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            model: "mock-llm".to_string(),
        }
    }

    /// Pop responses in order; the last one repeats once the script runs dry.
    pub fn scripted(responses: Vec<String>) -> Self {
        let responses = Arc::new(responses);
        Self::with_handler(move |index, _| {
            let clamped = index.min(responses.len().saturating_sub(1));
            responses
                .get(clamped)
                .cloned()
                .ok_or_else(|| ServiceError::Permanent("empty script".to_string()))
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().clone()
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmService for MockLlm {
    async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, ServiceError> {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        let index = {
            let mut calls = self.calls.lock();
            calls.push(request.clone());
            calls.len() - 1
        };
        let content = (self.handler)(index, &request)?;
        let tokens_used = (content.chars().count() / 4) as u32;
        Ok(ChatCompletion {
            content,
            model: self.model.clone(),
            tokens_used,
        })
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

/// Search double with optional leading failures for retry tests.
pub struct MockSearch {
    hits: Vec<SearchHit>,
    fail_first: AtomicU32,
    calls: AtomicU32,
}

impl MockSearch {
    pub fn new() -> Self {
        Self::with_hits(vec![
            SearchHit {
                title: "Reference one".to_string(),
                url: "https://example.com/1".to_string(),
                snippet: "Background material on the topic.".to_string(),
            },
            SearchHit {
                title: "Reference two".to_string(),
                url: "https://example.com/2".to_string(),
                snippet: "Further reading.".to_string(),
            },
        ])
    }

    pub fn with_hits(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            fail_first: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// The first `n` calls fail with a transient error.
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockSearch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchService for MockSearch {
    async fn search(
        &self,
        _query: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first.load(Ordering::SeqCst) {
            return Err(ServiceError::Transient("injected search failure".to_string()));
        }
        Ok(self.hits.iter().take(limit).cloned().collect())
    }
}

/// Image double producing deterministic URLs.
pub struct MockImage {
    fail_first: AtomicU32,
    calls: AtomicU32,
}

impl MockImage {
    pub fn new() -> Self {
        Self {
            fail_first: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing_first(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockImage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageService for MockImage {
    async fn generate(
        &self,
        prompt: &str,
        size: &str,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedImage>, ServiceError> {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first.load(Ordering::SeqCst) {
            return Err(ServiceError::Transient("injected image failure".to_string()));
        }
        Ok((0..count)
            .map(|i| GeneratedImage {
                url: format!("https://images.example/mock-{call}-{i}.png"),
                prompt: prompt.to_string(),
                size: size.to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ChatMessage;

    #[tokio::test]
    async fn scripted_responses_pop_in_order_then_repeat() {
        let llm = MockLlm::scripted(vec!["one".to_string(), "two".to_string()]);
        let cancel = CancellationToken::new();
        for expected in ["one", "two", "two"] {
            let completion = llm
                .chat(ChatRequest::new(vec![ChatMessage::user("hi")]), &cancel)
                .await
                .unwrap();
            assert_eq!(completion.content, expected);
        }
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn search_failure_injection() {
        let search = MockSearch::new().failing_first(2);
        let cancel = CancellationToken::new();
        assert!(search.search("q", 3, &cancel).await.is_err());
        assert!(search.search("q", 3, &cancel).await.is_err());
        assert!(search.search("q", 3, &cancel).await.is_ok());
        assert_eq!(search.call_count(), 3);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let llm = MockLlm::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = llm
            .chat(ChatRequest::new(vec![ChatMessage::user("hi")]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled));
    }
}
