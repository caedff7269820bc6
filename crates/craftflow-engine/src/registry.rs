//! Workflow registry: `workflowType → factory`.

use std::collections::HashMap;
use std::sync::Arc;

use craftflow_models::{ResultRecord, Task, WorkflowState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::graph::CompiledGraph;

/// Identity and classification of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescriptor {
    pub workflow_type: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    pub name: String,
    pub display_name: String,
}

/// Full metadata the API surface exposes for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    #[serde(flatten)]
    pub descriptor: WorkflowDescriptor,
    pub required_inputs: Vec<InputSpec>,
    pub optional_inputs: Vec<InputSpec>,
    /// Canonical happy-path steps, in order. Drives progress percentage.
    pub steps: Vec<StepInfo>,
    pub retry_classes: Vec<String>,
    #[serde(default)]
    pub examples: Vec<Value>,
}

impl WorkflowMetadata {
    /// `(index_of_current_step + 1) / total_steps × 100`, clamped monotone.
    pub fn progress_percent(&self, current_step: Option<&str>) -> u32 {
        let total = self.steps.len().max(1) as u32;
        let Some(step) = current_step else { return 0 };
        if step == "complete" {
            return 100;
        }
        match self.steps.iter().position(|s| s.name == step) {
            Some(index) => ((index as u32 + 1) * 100) / total,
            // The claim marker and unknown steps report no progress yet.
            None => 0,
        }
    }
}

/// Produces the ingredients the graph engine consumes. One per workflow type.
pub trait WorkflowFactory: Send + Sync + std::fmt::Debug {
    fn descriptor(&self) -> WorkflowDescriptor;
    fn metadata(&self) -> WorkflowMetadata;

    /// Validate request params; all problems at once.
    fn validate_params(&self, params: &Value) -> Result<(), Vec<String>>;

    fn create_graph(&self) -> CompiledGraph;

    /// Build the initial state from the task's immutable inputs.
    fn create_state(&self, task: &Task) -> Result<WorkflowState, EngineError>;

    /// Payload keys a checkpoint must never override on resume.
    fn immutable_inputs(&self) -> Vec<&'static str>;

    /// Deliverables to persist from a finished state.
    fn collect_results(&self, state: &WorkflowState) -> Vec<ResultRecord>;

    /// Primary content for webhook payloads.
    fn primary_content(&self, state: &WorkflowState) -> Option<String>;
}

/// Process-wide map, populated at startup.
#[derive(Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, Arc<dyn WorkflowFactory>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in workflows registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(
            crate::workflows::content_creator::ContentCreatorFactory,
        ));
        registry.register(Arc::new(crate::workflows::translation::TranslationFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn WorkflowFactory>) {
        self.factories
            .insert(factory.descriptor().workflow_type, factory);
    }

    pub fn get(&self, workflow_type: &str) -> Result<Arc<dyn WorkflowFactory>, EngineError> {
        self.factories
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_type.to_string()))
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// All metadata, optionally filtered by category and tags.
    pub fn list(&self, category: Option<&str>, tags: &[String]) -> Vec<WorkflowMetadata> {
        let mut entries: Vec<WorkflowMetadata> = self
            .factories
            .values()
            .map(|f| f.metadata())
            .filter(|m| category.is_none_or(|c| m.descriptor.category == c))
            .filter(|m| tags.iter().all(|t| m.descriptor.tags.contains(t)))
            .collect();
        entries.sort_by(|a, b| a.descriptor.workflow_type.cmp(&b.descriptor.workflow_type));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> WorkflowMetadata {
        WorkflowMetadata {
            descriptor: WorkflowDescriptor {
                workflow_type: "content-creator".to_string(),
                version: "1.0".to_string(),
                name: "Content creator".to_string(),
                description: String::new(),
                category: "content".to_string(),
                tags: vec![],
            },
            required_inputs: vec![],
            optional_inputs: vec![],
            steps: ["search", "organize", "write", "checkText"]
                .iter()
                .map(|s| StepInfo {
                    name: s.to_string(),
                    display_name: s.to_string(),
                })
                .collect(),
            retry_classes: vec!["text".to_string()],
            examples: vec![],
        }
    }

    #[test]
    fn progress_percentage() {
        let metadata = sample_metadata();
        assert_eq!(metadata.progress_percent(None), 0);
        assert_eq!(metadata.progress_percent(Some("claimed")), 0);
        assert_eq!(metadata.progress_percent(Some("search")), 25);
        assert_eq!(metadata.progress_percent(Some("write")), 75);
        assert_eq!(metadata.progress_percent(Some("checkText")), 100);
        assert_eq!(metadata.progress_percent(Some("complete")), 100);
    }

    #[test]
    fn unknown_workflow_lookup_fails() {
        let registry = WorkflowRegistry::with_builtins();
        assert!(registry.get("content-creator").is_ok());
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(err, EngineError::UnknownWorkflow(_)));
    }

    #[test]
    fn list_filters_by_category() {
        let registry = WorkflowRegistry::with_builtins();
        let all = registry.list(None, &[]);
        assert!(all.len() >= 2);
        let content = registry.list(Some("content"), &[]);
        assert!(
            content
                .iter()
                .all(|m| m.descriptor.category == "content")
        );
    }
}
