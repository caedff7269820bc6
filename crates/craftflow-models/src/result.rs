//! Persisted task results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::time::now_ms;

/// Result body: inline text or a reference to externally hosted content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResultContent {
    Inline { text: String },
    External { url: String },
}

/// One persisted result row. Append-only; a task may own several result
/// types (`article`, `finalArticle`, `image`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub result_id: String,
    pub task_id: String,
    pub result_type: String,
    pub content: ResultContent,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: i64,
}

impl ResultRecord {
    pub fn inline(task_id: &str, result_type: &str, text: impl Into<String>) -> Self {
        Self {
            result_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            result_type: result_type.to_string(),
            content: ResultContent::Inline { text: text.into() },
            metadata: Value::Object(Default::default()),
            created_at: now_ms(),
        }
    }

    pub fn external(task_id: &str, result_type: &str, url: impl Into<String>) -> Self {
        Self {
            result_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            result_type: result_type.to_string(),
            content: ResultContent::External { url: url.into() },
            metadata: Value::Object(Default::default()),
            created_at: now_ms(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_tagging_roundtrip() {
        let record = ResultRecord::inline("t-1", "article", "body");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["content"]["kind"], "inline");

        let back: ResultRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.content, record.content);
    }

    #[test]
    fn external_reference() {
        let record = ResultRecord::external("t-1", "image", "https://img.example/1.png");
        match record.content {
            ResultContent::External { ref url } => assert!(url.starts_with("https://")),
            _ => panic!("expected external content"),
        }
    }
}
