//! The translation workflow: `translate → checkQuality` with a
//! quality-gated retry loop around `translate` (class `translation`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use craftflow_models::{
    HardConstraints, QualityReport, ResultRecord, StatePatch, Task, WorkflowState,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{EngineError, NodeError};
use crate::graph::{CompiledGraph, Route};
use crate::node::{NodeContext, WorkflowNode, push_step};
use crate::quality::QualityGate;
use crate::registry::{
    InputSpec, StepInfo, WorkflowDescriptor, WorkflowFactory, WorkflowMetadata,
};
use crate::services::{ChatMessage, ChatRequest};

pub const WORKFLOW_TYPE: &str = "translation";

pub const STEP_TRANSLATE: &str = "translate";
pub const STEP_CHECK_QUALITY: &str = "checkQuality";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TranslationData {
    pub source_text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub translated_text: Option<String>,
    pub previous_translation: Option<String>,
    pub translation_quality: Option<QualityReport>,
    pub steps_completed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslationParams {
    source_text: String,
    source_lang: String,
    target_lang: String,
}

fn view(state: &WorkflowState) -> Result<TranslationData, NodeError> {
    state.data_view().map_err(NodeError::from)
}

struct TranslateNode;

#[async_trait]
impl WorkflowNode for TranslateNode {
    fn name(&self) -> &str {
        STEP_TRANSLATE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn validate(&self, state: &WorkflowState) -> Result<(), NodeError> {
        let data = view(state)?;
        if data.source_text.trim().is_empty() {
            return Err(NodeError::Validation(
                "sourceText must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError> {
        let data = view(state)?;

        let mut patch = StatePatch::new();
        let feedback = match (&data.translated_text, &data.translation_quality) {
            (Some(previous), Some(report)) if !report.passed => {
                patch.insert("previousTranslation".into(), json!(previous.clone()));
                Some((previous.clone(), report.fix_suggestions.clone()))
            }
            _ => None,
        };

        let user_prompt = match &feedback {
            Some((previous, suggestions)) => format!(
                "Translate the following text from {} to {}.\n\nSource:\n{}\n\n\
                 Your previous translation was rejected:\n{}\n\nFeedback:\n{}\n\n\
                 Produce an improved translation.",
                data.source_lang,
                data.target_lang,
                data.source_text,
                previous,
                suggestions
                    .iter()
                    .map(|s| format!("- {s}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            None => format!(
                "Translate the following text from {} to {}. Reply with the \
                 translation only.\n\n{}",
                data.source_lang, data.target_lang, data.source_text
            ),
        };

        let request = ChatRequest::new(vec![
            ChatMessage::system("You are a professional translator."),
            ChatMessage::user(user_prompt),
        ]);
        let completion = ctx.services.llm.chat(request, &ctx.cancel).await?;

        patch.insert("translatedText".into(), Value::String(completion.content));
        push_step(state, &mut patch, STEP_TRANSLATE);
        Ok(patch)
    }
}

struct CheckQualityNode;

#[async_trait]
impl WorkflowNode for CheckQualityNode {
    fn name(&self) -> &str {
        STEP_CHECK_QUALITY
    }

    fn validate(&self, state: &WorkflowState) -> Result<(), NodeError> {
        let data = view(state)?;
        match data.translated_text.as_deref() {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err(NodeError::Validation(
                "checkQuality requires a translation".to_string(),
            )),
        }
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError> {
        let data = view(state)?;
        let translation = data.translated_text.clone().unwrap_or_default();
        let requirements = format!(
            "A faithful, fluent translation from {} to {} of:\n{}",
            data.source_lang, data.target_lang, data.source_text
        );

        let gate = QualityGate::new(ctx.services.llm.clone(), ctx.config.quality_threshold);
        let report = gate
            .check_text(
                "translation",
                &translation,
                &requirements,
                &HardConstraints::default(),
                &ctx.cancel,
            )
            .await?;

        let mut patch = StatePatch::new();
        patch.insert("translationQuality".into(), serde_json::to_value(report)?);
        push_step(state, &mut patch, STEP_CHECK_QUALITY);
        Ok(patch)
    }
}

#[derive(Debug)]
pub struct TranslationFactory;

impl WorkflowFactory for TranslationFactory {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor {
            workflow_type: WORKFLOW_TYPE.to_string(),
            version: "1.0".to_string(),
            name: "Translation".to_string(),
            description: "Quality-gated machine translation.".to_string(),
            category: "language".to_string(),
            tags: vec!["translation".to_string()],
        }
    }

    fn metadata(&self) -> WorkflowMetadata {
        WorkflowMetadata {
            descriptor: self.descriptor(),
            required_inputs: vec![
                InputSpec {
                    name: "sourceText".to_string(),
                    description: "Text to translate".to_string(),
                    default: None,
                },
                InputSpec {
                    name: "sourceLang".to_string(),
                    description: "Source language".to_string(),
                    default: None,
                },
                InputSpec {
                    name: "targetLang".to_string(),
                    description: "Target language".to_string(),
                    default: None,
                },
            ],
            optional_inputs: vec![],
            steps: vec![
                StepInfo {
                    name: STEP_TRANSLATE.to_string(),
                    display_name: "Translate".to_string(),
                },
                StepInfo {
                    name: STEP_CHECK_QUALITY.to_string(),
                    display_name: "Quality check".to_string(),
                },
            ],
            retry_classes: vec!["translation".to_string()],
            examples: vec![json!({
                "sourceText": "Hello, world",
                "sourceLang": "en",
                "targetLang": "zh"
            })],
        }
    }

    fn validate_params(&self, params: &Value) -> Result<(), Vec<String>> {
        let parsed: TranslationParams = serde_json::from_value(params.clone())
            .map_err(|e| vec![format!("malformed params: {e}")])?;

        let mut problems = Vec::new();
        if parsed.source_text.trim().is_empty() {
            problems.push("sourceText must not be empty".to_string());
        }
        if parsed.source_lang.trim().is_empty() {
            problems.push("sourceLang must not be empty".to_string());
        }
        if parsed.target_lang.trim().is_empty() {
            problems.push("targetLang must not be empty".to_string());
        }
        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }

    fn create_graph(&self) -> CompiledGraph {
        CompiledGraph::builder()
            .node(Arc::new(TranslateNode))
            .node(Arc::new(CheckQualityNode))
            .edge(STEP_TRANSLATE, STEP_CHECK_QUALITY)
            .route(STEP_CHECK_QUALITY, |state| {
                let passed = state
                    .data
                    .get("translationQuality")
                    .and_then(|v| v.get("passed"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                Route::Quality {
                    class: "translation".to_string(),
                    passed,
                    retry_to: STEP_TRANSLATE.to_string(),
                    pass_to: None,
                }
            })
            .build()
    }

    fn create_state(&self, task: &Task) -> Result<WorkflowState, EngineError> {
        let params: TranslationParams = serde_json::from_value(task.typed_inputs.clone())
            .map_err(|e| EngineError::InvalidParams(e.to_string()))?;

        let data = TranslationData {
            source_text: params.source_text,
            source_lang: params.source_lang.clone(),
            target_lang: params.target_lang.clone(),
            ..Default::default()
        };

        let mut state = WorkflowState::for_task(task);
        state.data = WorkflowState::data_from(&data)
            .map_err(|e| EngineError::InvalidParams(e.to_string()))?;
        state.base.metadata.insert(
            "languagePair".to_string(),
            Value::String(format!("{}->{}", params.source_lang, params.target_lang)),
        );
        Ok(state)
    }

    fn immutable_inputs(&self) -> Vec<&'static str> {
        vec!["sourceText", "sourceLang", "targetLang"]
    }

    fn collect_results(&self, state: &WorkflowState) -> Vec<ResultRecord> {
        let Ok(data) = state.data_view::<TranslationData>() else {
            return vec![];
        };
        data.translated_text
            .map(|text| {
                vec![
                    ResultRecord::inline(&state.base.task_id, "text", text).with_metadata(
                        json!({"sourceLang": data.source_lang, "targetLang": data.target_lang}),
                    ),
                ]
            })
            .unwrap_or_default()
    }

    fn primary_content(&self, state: &WorkflowState) -> Option<String> {
        state
            .data_view::<TranslationData>()
            .ok()
            .and_then(|data| data.translated_text)
    }
}
