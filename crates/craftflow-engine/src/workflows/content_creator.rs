//! The content-creator workflow:
//! `search → organize → write → checkText → generateImage → checkImage → postProcess`
//! with quality-gated retry loops around `write` (class `text`) and
//! `generateImage` (class `image`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use craftflow_models::{
    HardConstraints, QualityReport, ResultRecord, StatePatch, Task, WorkflowState, now_ms,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::error::{EngineError, NodeError};
use crate::graph::{CompiledGraph, Route};
use crate::node::{NodeContext, WorkflowNode, push_step};
use crate::quality::soft_score::extract_json;
use crate::quality::{QualityGate, RUBRIC_VERSION};
use crate::registry::{
    InputSpec, StepInfo, WorkflowDescriptor, WorkflowFactory, WorkflowMetadata,
};
use crate::services::{ChatMessage, ChatRequest, GeneratedImage, SearchHit};

pub const WORKFLOW_TYPE: &str = "content-creator";

pub const STEP_SEARCH: &str = "search";
pub const STEP_ORGANIZE: &str = "organize";
pub const STEP_WRITE: &str = "write";
pub const STEP_CHECK_TEXT: &str = "checkText";
pub const STEP_GENERATE_IMAGE: &str = "generateImage";
pub const STEP_CHECK_IMAGE: &str = "checkImage";
pub const STEP_POST_PROCESS: &str = "postProcess";

const DEFAULT_IMAGE_SIZE: &str = "1920x1920";
const DEFAULT_IMAGE_COUNT: u32 = 1;
const SEARCH_RESULT_LIMIT: usize = 5;
/// Neutral score assigned when one image evaluation fails; the image phase
/// is non-critical and must not sink the task.
const NEUTRAL_IMAGE_SCORE: f64 = 7.0;

/// Typed view over the workflow payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentCreatorData {
    pub topic: String,
    pub requirements: String,
    pub hard_constraints: HardConstraints,
    pub image_size: String,
    pub image_count: u32,
    pub search_results: Option<Vec<SearchHit>>,
    pub organized_info: Option<String>,
    pub article_content: Option<String>,
    pub previous_content: Option<String>,
    pub images: Option<Vec<GeneratedImage>>,
    pub text_quality: Option<QualityReport>,
    pub image_quality: Option<QualityReport>,
    pub final_article: Option<String>,
    pub steps_completed: Vec<String>,
}

/// Create-task params accepted for this workflow.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentCreatorParams {
    topic: String,
    requirements: String,
    #[serde(default)]
    hard_constraints: HardConstraints,
    image_size: Option<String>,
    image_count: Option<u32>,
}

fn view(state: &WorkflowState) -> Result<ContentCreatorData, NodeError> {
    state.data_view().map_err(NodeError::from)
}

fn constraints_summary(constraints: &HardConstraints) -> String {
    let mut parts = Vec::new();
    if let (Some(min), Some(max)) = (constraints.min_words, constraints.max_words) {
        parts.push(format!("length between {min} and {max} words"));
    } else if let Some(min) = constraints.min_words {
        parts.push(format!("at least {min} words"));
    } else if let Some(max) = constraints.max_words {
        parts.push(format!("at most {max} words"));
    }
    if !constraints.required_keywords.is_empty() {
        parts.push(format!(
            "must contain the keywords: {}",
            constraints.required_keywords.join(", ")
        ));
    }
    if !constraints.forbidden_words.is_empty() {
        parts.push(format!(
            "must not contain: {}",
            constraints.forbidden_words.join(", ")
        ));
    }
    parts.join("; ")
}

struct SearchNode;

#[async_trait]
impl WorkflowNode for SearchNode {
    fn name(&self) -> &str {
        STEP_SEARCH
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn validate(&self, state: &WorkflowState) -> Result<(), NodeError> {
        let data = view(state)?;
        if data.topic.trim().is_empty() {
            return Err(NodeError::Validation("topic must not be empty".to_string()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError> {
        let data = view(state)?;
        let hits = ctx
            .services
            .search
            .search(&data.topic, SEARCH_RESULT_LIMIT, &ctx.cancel)
            .await?;

        let mut patch = StatePatch::new();
        patch.insert("searchResults".into(), serde_json::to_value(hits)?);
        push_step(state, &mut patch, STEP_SEARCH);
        Ok(patch)
    }
}

struct OrganizeNode;

#[async_trait]
impl WorkflowNode for OrganizeNode {
    fn name(&self) -> &str {
        STEP_ORGANIZE
    }

    fn validate(&self, state: &WorkflowState) -> Result<(), NodeError> {
        let data = view(state)?;
        if data.search_results.is_none() {
            return Err(NodeError::Validation(
                "organize requires search results".to_string(),
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
        let hits = data.search_results.unwrap_or_default();
        let digest: String = hits
            .iter()
            .map(|h| format!("- {} ({}): {}", h.title, h.url, h.snippet))
            .collect::<Vec<_>>()
            .join("\n");

        let request = ChatRequest::new(vec![
            ChatMessage::system(
                "You are a research assistant. Organize the collected material \
                 into a structured outline with the key facts worth covering. \
                 Reply with the outline only.",
            ),
            ChatMessage::user(format!(
                "Topic: {}\nRequirements: {}\n\nCollected material:\n{}",
                data.topic, data.requirements, digest
            )),
        ]);
        let completion = ctx.services.llm.chat(request, &ctx.cancel).await?;

        let mut patch = StatePatch::new();
        patch.insert("organizedInfo".into(), Value::String(completion.content));
        push_step(state, &mut patch, STEP_ORGANIZE);
        Ok(patch)
    }
}

struct WriteNode;

#[async_trait]
impl WorkflowNode for WriteNode {
    fn name(&self) -> &str {
        STEP_WRITE
    }

    fn retry_count(&self) -> u32 {
        2
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn validate(&self, state: &WorkflowState) -> Result<(), NodeError> {
        let data = view(state)?;
        match data.organized_info.as_deref() {
            Some(info) if !info.trim().is_empty() => Ok(()),
            _ => Err(NodeError::Validation(
                "write requires organized information".to_string(),
            )),
        }
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError> {
        let data = view(state)?;
        let outline = data.organized_info.clone().unwrap_or_default();
        let constraints = constraints_summary(&data.hard_constraints);

        let mut patch = StatePatch::new();
        // Revision mode: the previous draft failed its quality check, so
        // rewrite against the gate's feedback instead of starting over.
        let rewrite = match (&data.article_content, &data.text_quality) {
            (Some(article), Some(report)) if !report.passed => {
                patch.insert("previousContent".into(), json!(article.clone()));
                Some((article.clone(), report.fix_suggestions.clone()))
            }
            _ => None,
        };

        let user_prompt = match &rewrite {
            Some((previous, suggestions)) => format!(
                "Topic: {}\nRequirements: {}\nConstraints: {}\n\nOutline:\n{}\n\n\
                 Your previous draft did not pass review:\n{}\n\n\
                 Reviewer feedback:\n{}\n\n\
                 Revise the draft to address every point of feedback. Keep what \
                 already works; do not start from scratch.",
                data.topic,
                data.requirements,
                constraints,
                outline,
                previous,
                suggestions
                    .iter()
                    .map(|s| format!("- {s}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            None => format!(
                "Topic: {}\nRequirements: {}\nConstraints: {}\n\nOutline:\n{}\n\n\
                 Write the full article in Markdown, starting with a level-1 \
                 heading and ending with a conclusion section.",
                data.topic, data.requirements, constraints, outline,
            ),
        };

        let request = ChatRequest::new(vec![
            ChatMessage::system("You are a professional long-form content writer."),
            ChatMessage::user(user_prompt),
        ])
        .with_temperature(0.7);
        let completion = ctx.services.llm.chat(request, &ctx.cancel).await?;

        patch.insert("articleContent".into(), Value::String(completion.content));
        push_step(state, &mut patch, STEP_WRITE);
        Ok(patch)
    }
}

struct CheckTextNode;

#[async_trait]
impl WorkflowNode for CheckTextNode {
    fn name(&self) -> &str {
        STEP_CHECK_TEXT
    }

    fn validate(&self, state: &WorkflowState) -> Result<(), NodeError> {
        let data = view(state)?;
        match data.article_content.as_deref() {
            Some(article) if !article.trim().is_empty() => Ok(()),
            _ => Err(NodeError::Validation(
                "checkText requires non-empty articleContent".to_string(),
            )),
        }
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError> {
        let data = view(state)?;
        let article = data.article_content.clone().unwrap_or_default();
        let gate = QualityGate::new(ctx.services.llm.clone(), ctx.config.quality_threshold);
        let report = gate
            .check_text(
                "text",
                &article,
                &data.requirements,
                &data.hard_constraints,
                &ctx.cancel,
            )
            .await?;

        let mut patch = StatePatch::new();
        patch.insert("textQuality".into(), serde_json::to_value(report)?);
        push_step(state, &mut patch, STEP_CHECK_TEXT);
        Ok(patch)
    }
}

struct GenerateImageNode;

#[async_trait]
impl WorkflowNode for GenerateImageNode {
    fn name(&self) -> &str {
        STEP_GENERATE_IMAGE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError> {
        let data = view(state)?;
        let mut prompt = format!(
            "An illustrative cover image for an article about: {}",
            data.topic
        );
        // On an image-quality retry, fold the reviewer feedback into the prompt.
        if let Some(report) = &data.image_quality
            && !report.passed
            && !report.fix_suggestions.is_empty()
        {
            prompt.push_str(&format!(
                ". Address this feedback: {}",
                report.fix_suggestions.join("; ")
            ));
        }

        let images = ctx
            .services
            .image
            .generate(
                &prompt,
                &data.image_size,
                data.image_count as usize,
                &ctx.cancel,
            )
            .await?;

        let mut patch = StatePatch::new();
        patch.insert("images".into(), serde_json::to_value(images)?);
        push_step(state, &mut patch, STEP_GENERATE_IMAGE);
        Ok(patch)
    }
}

struct CheckImageNode;

impl CheckImageNode {
    /// Score one image; any failure degrades to the neutral score because
    /// the image phase never fails the task.
    async fn score_image(image: &GeneratedImage, topic: &str, ctx: &NodeContext) -> f64 {
        let request = ChatRequest::new(vec![
            ChatMessage::system(
                "You assess whether a generated image fits an article. Reply \
                 with ONLY a JSON object: {\"score\": n} where n is 0-10.",
            ),
            ChatMessage::user(format!(
                "Article topic: {topic}\nImage prompt: {}\nImage URL: {}",
                image.prompt, image.url
            )),
        ]);
        match ctx.services.llm.chat(request, &ctx.cancel).await {
            Ok(completion) => extract_json(&completion.content)
                .and_then(|v| v.get("score").and_then(|s| s.as_f64()))
                .map(|s| s.clamp(0.0, 10.0))
                .unwrap_or(NEUTRAL_IMAGE_SCORE),
            Err(e) => {
                warn!(url = %image.url, error = %e, "Image evaluation failed, using neutral score");
                NEUTRAL_IMAGE_SCORE
            }
        }
    }
}

#[async_trait]
impl WorkflowNode for CheckImageNode {
    fn name(&self) -> &str {
        STEP_CHECK_IMAGE
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError> {
        let data = view(state)?;
        let images = data.images.clone().unwrap_or_default();

        // No images to judge: continue with an empty passing report rather
        // than triggering generation from inside the checker.
        let report = if images.is_empty() {
            QualityReport::empty_pass("image", RUBRIC_VERSION)
        } else {
            let mut score_futures: Vec<
                std::pin::Pin<Box<dyn std::future::Future<Output = f64> + Send + '_>>,
            > = Vec::with_capacity(images.len());
            for image in images.iter() {
                let topic = data.topic.clone();
                score_futures.push(Box::pin(async move {
                    Self::score_image(image, &topic, ctx).await
                }));
            }
            let scores: Vec<f64> = futures::stream::iter(score_futures)
                .buffer_unordered(ctx.config.image_eval_parallelism)
                .collect()
                .await;
            let average = scores.iter().sum::<f64>() / scores.len() as f64;
            let passed = average >= ctx.config.quality_threshold;
            QualityReport {
                phase: "image".to_string(),
                score: average,
                passed,
                hard_constraints_passed: true,
                details: json!({"perImageScores": scores, "imageCount": images.len()}),
                fix_suggestions: if passed {
                    vec![]
                } else {
                    vec![format!(
                        "make the imagery more concretely about: {}",
                        data.topic
                    )]
                },
                rubric_version: RUBRIC_VERSION.to_string(),
                model_name: Some(ctx.services.llm.model_name()),
                checked_at: now_ms(),
            }
        };

        let mut patch = StatePatch::new();
        patch.insert("imageQuality".into(), serde_json::to_value(report)?);
        push_step(state, &mut patch, STEP_CHECK_IMAGE);
        Ok(patch)
    }
}

struct PostProcessNode;

#[async_trait]
impl WorkflowNode for PostProcessNode {
    fn name(&self) -> &str {
        STEP_POST_PROCESS
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn validate(&self, state: &WorkflowState) -> Result<(), NodeError> {
        let data = view(state)?;
        if data.article_content.is_none() {
            return Err(NodeError::Validation(
                "postProcess requires articleContent".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<StatePatch, NodeError> {
        let data = view(state)?;
        let article = data.article_content.clone().unwrap_or_default();

        let mut final_article = if article.trim_start().starts_with("# ") {
            article
        } else {
            format!("# {}\n\n{}", data.topic, article)
        };
        if let Some(images) = &data.images
            && !images.is_empty()
        {
            final_article.push_str("\n\n");
            for image in images {
                final_article.push_str(&format!("![{}]({})\n", data.topic, image.url));
            }
        }

        let mut patch = StatePatch::new();
        patch.insert("finalArticle".into(), Value::String(final_article));
        push_step(state, &mut patch, STEP_POST_PROCESS);
        Ok(patch)
    }
}

fn quality_route(class: &'static str, retry_to: &'static str, pass_to: &'static str) -> impl Fn(&WorkflowState) -> Route {
    move |state: &WorkflowState| {
        let passed = state
            .data
            .get(&format!("{class}Quality"))
            .and_then(|v| v.get("passed"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Route::Quality {
            class: class.to_string(),
            passed,
            retry_to: retry_to.to_string(),
            pass_to: Some(pass_to.to_string()),
        }
    }
}

/// Factory for the content-creator workflow.
#[derive(Debug)]
pub struct ContentCreatorFactory;

impl WorkflowFactory for ContentCreatorFactory {
    fn descriptor(&self) -> WorkflowDescriptor {
        WorkflowDescriptor {
            workflow_type: WORKFLOW_TYPE.to_string(),
            version: "1.2".to_string(),
            name: "Content creator".to_string(),
            description: "Research a topic, write a quality-gated article and illustrate it."
                .to_string(),
            category: "content".to_string(),
            tags: vec!["article".to_string(), "image".to_string()],
        }
    }

    fn metadata(&self) -> WorkflowMetadata {
        WorkflowMetadata {
            descriptor: self.descriptor(),
            required_inputs: vec![
                InputSpec {
                    name: "topic".to_string(),
                    description: "Subject of the article".to_string(),
                    default: None,
                },
                InputSpec {
                    name: "requirements".to_string(),
                    description: "Free-form writing requirements".to_string(),
                    default: None,
                },
            ],
            optional_inputs: vec![
                InputSpec {
                    name: "hardConstraints".to_string(),
                    description: "Deterministic checks: word bounds, keywords, structure"
                        .to_string(),
                    default: Some(json!({})),
                },
                InputSpec {
                    name: "imageSize".to_string(),
                    description: "Generated image dimensions".to_string(),
                    default: Some(json!(DEFAULT_IMAGE_SIZE)),
                },
                InputSpec {
                    name: "imageCount".to_string(),
                    description: "Number of images to generate".to_string(),
                    default: Some(json!(DEFAULT_IMAGE_COUNT)),
                },
            ],
            steps: [
                (STEP_SEARCH, "Web search"),
                (STEP_ORGANIZE, "Organize material"),
                (STEP_WRITE, "Write article"),
                (STEP_CHECK_TEXT, "Text quality check"),
                (STEP_GENERATE_IMAGE, "Generate images"),
                (STEP_CHECK_IMAGE, "Image quality check"),
                (STEP_POST_PROCESS, "Post-process"),
            ]
            .iter()
            .map(|(name, display)| StepInfo {
                name: name.to_string(),
                display_name: display.to_string(),
            })
            .collect(),
            retry_classes: vec!["text".to_string(), "image".to_string()],
            examples: vec![json!({
                "topic": "AI 技术的发展",
                "requirements": "写一篇 500-1000 字的文章，包含 AI、人工智能",
                "hardConstraints": {"minWords": 500, "maxWords": 1000, "keywords": ["AI", "人工智能"]}
            })],
        }
    }

    fn validate_params(&self, params: &Value) -> Result<(), Vec<String>> {
        let parsed: ContentCreatorParams = serde_json::from_value(params.clone())
            .map_err(|e| vec![format!("malformed params: {e}")])?;

        let mut problems = Vec::new();
        if parsed.topic.trim().is_empty() {
            problems.push("topic must not be empty".to_string());
        }
        if parsed.requirements.trim().is_empty() {
            problems.push("requirements must not be empty".to_string());
        }
        if let (Some(min), Some(max)) = (
            parsed.hard_constraints.min_words,
            parsed.hard_constraints.max_words,
        ) && min > max
        {
            problems.push(format!("minWords {min} exceeds maxWords {max}"));
        }
        if parsed.image_count.is_some_and(|n| n > 8) {
            problems.push("imageCount must be at most 8".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    fn create_graph(&self) -> CompiledGraph {
        CompiledGraph::builder()
            .node(Arc::new(SearchNode))
            .node(Arc::new(OrganizeNode))
            .node(Arc::new(WriteNode))
            .node(Arc::new(CheckTextNode))
            .node(Arc::new(GenerateImageNode))
            .node(Arc::new(CheckImageNode))
            .node(Arc::new(PostProcessNode))
            .edge(STEP_SEARCH, STEP_ORGANIZE)
            .edge(STEP_ORGANIZE, STEP_WRITE)
            .edge(STEP_WRITE, STEP_CHECK_TEXT)
            .route(
                STEP_CHECK_TEXT,
                quality_route("text", STEP_WRITE, STEP_GENERATE_IMAGE),
            )
            .edge(STEP_GENERATE_IMAGE, STEP_CHECK_IMAGE)
            .route(
                STEP_CHECK_IMAGE,
                quality_route("image", STEP_GENERATE_IMAGE, STEP_POST_PROCESS),
            )
            .build()
    }

    fn create_state(&self, task: &Task) -> Result<WorkflowState, EngineError> {
        let params: ContentCreatorParams = serde_json::from_value(task.typed_inputs.clone())
            .map_err(|e| EngineError::InvalidParams(e.to_string()))?;

        let data = ContentCreatorData {
            topic: params.topic.clone(),
            requirements: params.requirements,
            hard_constraints: params.hard_constraints,
            image_size: params
                .image_size
                .unwrap_or_else(|| DEFAULT_IMAGE_SIZE.to_string()),
            image_count: params.image_count.unwrap_or(DEFAULT_IMAGE_COUNT),
            ..Default::default()
        };

        let mut state = WorkflowState::for_task(task);
        state.data = WorkflowState::data_from(&data)
            .map_err(|e| EngineError::InvalidParams(e.to_string()))?;
        state
            .base
            .metadata
            .insert("topic".to_string(), Value::String(params.topic));
        Ok(state)
    }

    fn immutable_inputs(&self) -> Vec<&'static str> {
        vec![
            "topic",
            "requirements",
            "hardConstraints",
            "imageSize",
            "imageCount",
        ]
    }

    fn collect_results(&self, state: &WorkflowState) -> Vec<ResultRecord> {
        let task_id = &state.base.task_id;
        let Ok(data) = state.data_view::<ContentCreatorData>() else {
            return vec![];
        };

        let mut records = Vec::new();
        if let Some(article) = &data.article_content {
            records.push(ResultRecord::inline(task_id, "article", article.clone()));
        }
        if let Some(final_article) = &data.final_article {
            records.push(
                ResultRecord::inline(task_id, "finalArticle", final_article.clone())
                    .with_metadata(json!({"topic": data.topic})),
            );
        }
        for image in data.images.unwrap_or_default() {
            records.push(
                ResultRecord::external(task_id, "image", image.url.clone())
                    .with_metadata(json!({"prompt": image.prompt, "size": image.size})),
            );
        }
        records
    }

    fn primary_content(&self, state: &WorkflowState) -> Option<String> {
        let data = state.data_view::<ContentCreatorData>().ok()?;
        data.final_article.or(data.article_content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::Services;
    use crate::services::mock::{MockImage, MockLlm, MockSearch};
    use craftflow_models::{NewTask, TaskMode};
    use tokio_util::sync::CancellationToken;

    fn make_task(inputs: Value) -> Task {
        Task::new(NewTask {
            workflow_type: WORKFLOW_TYPE.to_string(),
            mode: TaskMode::Sync,
            priority: 0,
            idempotency_key: None,
            callback_url: None,
            callback_events: vec![],
            typed_inputs: inputs,
        })
    }

    fn make_ctx(llm: MockLlm) -> NodeContext {
        NodeContext::new(
            Services::new(
                Arc::new(llm),
                Arc::new(MockSearch::new()),
                Arc::new(MockImage::new()),
            ),
            CancellationToken::new(),
            Arc::new(EngineConfig::default()),
        )
    }

    fn valid_inputs() -> Value {
        json!({
            "topic": "AI 技术的发展",
            "requirements": "写一篇 500-1000 字的文章",
            "hardConstraints": {"minWords": 500, "maxWords": 1000, "keywords": ["AI"]}
        })
    }

    #[test]
    fn params_validation_reports_all_problems() {
        let factory = ContentCreatorFactory;
        assert!(factory.validate_params(&valid_inputs()).is_ok());

        let problems = factory
            .validate_params(&json!({"topic": " ", "requirements": ""}))
            .unwrap_err();
        assert_eq!(problems.len(), 2);

        let problems = factory
            .validate_params(&json!({
                "topic": "x", "requirements": "y",
                "hardConstraints": {"minWords": 100, "maxWords": 50}
            }))
            .unwrap_err();
        assert!(problems[0].contains("minWords"));
    }

    #[test]
    fn create_state_applies_defaults() {
        let factory = ContentCreatorFactory;
        let state = factory.create_state(&make_task(valid_inputs())).unwrap();
        let data: ContentCreatorData = state.data_view().unwrap();
        assert_eq!(data.image_size, DEFAULT_IMAGE_SIZE);
        assert_eq!(data.image_count, 1);
        assert_eq!(data.topic, "AI 技术的发展");
        assert_eq!(state.base.metadata["topic"], "AI 技术的发展");
    }

    #[test]
    fn graph_shape_and_entry() {
        let graph = ContentCreatorFactory.create_graph();
        assert_eq!(graph.entry(), STEP_SEARCH);
        assert_eq!(graph.step_names().len(), 7);
        assert!(graph.contains(STEP_POST_PROCESS));
    }

    #[tokio::test]
    async fn write_node_enters_revision_mode_after_failed_check() {
        let factory = ContentCreatorFactory;
        let mut state = factory.create_state(&make_task(valid_inputs())).unwrap();
        state
            .data
            .insert("organizedInfo".into(), json!("outline"));
        state
            .data
            .insert("articleContent".into(), json!("first draft"));
        let mut failed = QualityReport::empty_pass("text", RUBRIC_VERSION);
        failed.passed = false;
        failed.fix_suggestions = vec!["add the keyword AI".to_string()];
        state
            .data
            .insert("textQuality".into(), serde_json::to_value(&failed).unwrap());

        let llm = MockLlm::scripted(vec!["revised draft with AI".to_string()]);
        let ctx = make_ctx(llm);
        let patch = WriteNode.execute(&state, &ctx).await.unwrap();

        assert_eq!(patch["previousContent"], "first draft");
        assert_eq!(patch["articleContent"], "revised draft with AI");
    }

    #[tokio::test]
    async fn write_node_first_draft_has_no_previous_content() {
        let factory = ContentCreatorFactory;
        let mut state = factory.create_state(&make_task(valid_inputs())).unwrap();
        state
            .data
            .insert("organizedInfo".into(), json!("outline"));

        let ctx = make_ctx(MockLlm::scripted(vec!["draft".to_string()]));
        let patch = WriteNode.execute(&state, &ctx).await.unwrap();
        assert!(!patch.contains_key("previousContent"));
    }

    #[tokio::test]
    async fn check_image_with_no_images_passes_empty() {
        let factory = ContentCreatorFactory;
        let state = factory.create_state(&make_task(valid_inputs())).unwrap();
        let ctx = make_ctx(MockLlm::new());

        let patch = CheckImageNode.execute(&state, &ctx).await.unwrap();
        let report: QualityReport =
            serde_json::from_value(patch["imageQuality"].clone()).unwrap();
        assert!(report.passed);
    }

    #[tokio::test]
    async fn check_image_averages_scores_and_degrades_failures() {
        let factory = ContentCreatorFactory;
        let mut state = factory.create_state(&make_task(valid_inputs())).unwrap();
        state.data.insert(
            "images".into(),
            serde_json::to_value(vec![
                GeneratedImage {
                    url: "https://images.example/a.png".to_string(),
                    prompt: "p".to_string(),
                    size: "1920x1920".to_string(),
                },
                GeneratedImage {
                    url: "https://images.example/b.png".to_string(),
                    prompt: "p".to_string(),
                    size: "1920x1920".to_string(),
                },
            ])
            .unwrap(),
        );

        // One parseable score, one garbage reply that degrades to neutral.
        let llm = MockLlm::with_handler(|index, _| {
            Ok(if index == 0 {
                r#"{"score": 9}"#.to_string()
            } else {
                "no json".to_string()
            })
        });
        let ctx = make_ctx(llm);
        let patch = CheckImageNode.execute(&state, &ctx).await.unwrap();
        let report: QualityReport =
            serde_json::from_value(patch["imageQuality"].clone()).unwrap();
        // (9 + 7) / 2 = 8 ≥ threshold.
        assert!(report.passed);
        assert!((report.score - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn post_process_adds_heading_and_image_refs() {
        let factory = ContentCreatorFactory;
        let mut state = factory.create_state(&make_task(valid_inputs())).unwrap();
        state
            .data
            .insert("articleContent".into(), json!("body text"));
        state.data.insert(
            "images".into(),
            serde_json::to_value(vec![GeneratedImage {
                url: "https://images.example/a.png".to_string(),
                prompt: "p".to_string(),
                size: "1920x1920".to_string(),
            }])
            .unwrap(),
        );

        let ctx = make_ctx(MockLlm::new());
        let patch = PostProcessNode.execute(&state, &ctx).await.unwrap();
        let final_article = patch["finalArticle"].as_str().unwrap();
        assert!(final_article.starts_with("# AI 技术的发展"));
        assert!(final_article.contains("https://images.example/a.png"));
    }

    #[test]
    fn collect_results_includes_deliverables() {
        let factory = ContentCreatorFactory;
        let mut state = factory.create_state(&make_task(valid_inputs())).unwrap();
        state
            .data
            .insert("articleContent".into(), json!("draft"));
        state.data.insert("finalArticle".into(), json!("# final"));
        state.data.insert(
            "images".into(),
            serde_json::to_value(vec![GeneratedImage {
                url: "https://images.example/a.png".to_string(),
                prompt: "p".to_string(),
                size: "1920x1920".to_string(),
            }])
            .unwrap(),
        );

        let records = factory.collect_results(&state);
        let types: Vec<&str> = records.iter().map(|r| r.result_type.as_str()).collect();
        assert_eq!(types, vec!["article", "finalArticle", "image"]);
        assert_eq!(
            factory.primary_content(&state).as_deref(),
            Some("# final")
        );
    }
}
