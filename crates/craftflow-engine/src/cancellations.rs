//! Per-task cancellation tokens.
//!
//! Cancellation is an explicit signal threaded through contexts, never an
//! exception: the API cancels a token here, the node in flight observes it
//! at its next suspension point, and the engine converts the outcome into
//! the `cancelled` task state.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a child token for a task. Cancelling the parent (e.g. pool
    /// shutdown) cancels every registered task too.
    pub fn register(&self, task_id: &str, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.tokens.lock().insert(task_id.to_string(), token.clone());
        token
    }

    /// Signal one task. Returns false when the task is not executing here.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.lock().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, task_id: &str) {
        self.tokens.lock().remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reaches_registered_token() {
        let registry = CancelRegistry::new();
        let parent = CancellationToken::new();
        let token = registry.register("t-1", &parent);

        assert!(!token.is_cancelled());
        assert!(registry.cancel("t-1"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel("t-2"));
    }

    #[test]
    fn parent_cancellation_propagates() {
        let registry = CancelRegistry::new();
        let parent = CancellationToken::new();
        let token = registry.register("t-1", &parent);

        parent.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_clears_entry() {
        let registry = CancelRegistry::new();
        let parent = CancellationToken::new();
        registry.register("t-1", &parent);
        registry.remove("t-1");
        assert!(registry.is_empty());
    }
}
