//! Soft score: LLM-evaluated rubric with a strict JSON reply.
//!
//! The evaluator prompt demands a JSON object with 0–10 scores per
//! dimension. Extraction is forgiving about code fences and leading prose;
//! a reply that still fails to parse yields the neutral fallback score
//! rather than failing the workflow.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::services::{ChatMessage, ChatRequest, LlmService, ServiceError};

/// Neutral score used when the evaluator's reply is unparseable.
pub const FALLBACK_SCORE: f64 = 7.0;

/// `(dimension, weight)` pairs; weights sum to 1.
pub const DIMENSION_WEIGHTS: [(&str, f64); 4] = [
    ("relevance", 0.3),
    ("coherence", 0.3),
    ("completeness", 0.2),
    ("readability", 0.2),
];

#[derive(Debug, Clone)]
pub struct SoftScore {
    pub score: f64,
    pub dimensions: BTreeMap<String, f64>,
    pub suggestions: Vec<String>,
    pub model_name: String,
    pub tokens_used: u32,
    /// True when the fallback was used instead of a parsed reply.
    pub fallback: bool,
}

/// Pull a JSON object out of an LLM reply: strip code fences, then take the
/// outermost `{...}` span.
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed);

    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&unfenced[start..=end]).ok()
}

fn evaluator_prompt(artifact: &str, requirements: &str) -> Vec<ChatMessage> {
    let dimensions: Vec<&str> = DIMENSION_WEIGHTS.iter().map(|(name, _)| *name).collect();
    vec![
        ChatMessage::system(format!(
            "You are a strict content quality evaluator. Score the submitted \
             content against the stated requirements on a 0-10 scale for each \
             dimension: {}. Reply with ONLY a JSON object of the shape \
             {{\"relevance\": n, \"coherence\": n, \"completeness\": n, \
             \"readability\": n, \"suggestions\": [\"...\"]}} and nothing else.",
            dimensions.join(", ")
        )),
        ChatMessage::user(format!(
            "Requirements:\n{requirements}\n\nContent:\n{artifact}"
        )),
    ]
}

fn weighted_score(parsed: &Value) -> Option<(f64, BTreeMap<String, f64>)> {
    let mut dimensions = BTreeMap::new();
    let mut total = 0.0;
    for (name, weight) in DIMENSION_WEIGHTS {
        let value = parsed.get(name)?.as_f64()?.clamp(0.0, 10.0);
        dimensions.insert(name.to_string(), value);
        total += value * weight;
    }
    Some((total, dimensions))
}

/// Ask the LLM for a rubric evaluation of `artifact`.
///
/// Transport failures propagate (the node runtime retries them); parse
/// failures degrade to [`FALLBACK_SCORE`] with empty suggestions.
pub async fn score(
    llm: &Arc<dyn LlmService>,
    artifact: &str,
    requirements: &str,
    cancel: &CancellationToken,
) -> Result<SoftScore, ServiceError> {
    let request = ChatRequest::new(evaluator_prompt(artifact, requirements)).with_temperature(0.0);
    let completion = llm.chat(request, cancel).await?;

    let parsed = extract_json(&completion.content).and_then(|v| {
        weighted_score(&v).map(|(score, dimensions)| {
            let suggestions = v
                .get("suggestions")
                .and_then(|s| s.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            (score, dimensions, suggestions)
        })
    });

    match parsed {
        Some((score, dimensions, suggestions)) => Ok(SoftScore {
            score,
            dimensions,
            suggestions,
            model_name: completion.model,
            tokens_used: completion.tokens_used,
            fallback: false,
        }),
        None => {
            warn!(
                model = %completion.model,
                "Evaluator reply was not valid JSON, using neutral fallback score"
            );
            Ok(SoftScore {
                score: FALLBACK_SCORE,
                dimensions: BTreeMap::new(),
                suggestions: vec![],
                model_name: completion.model,
                tokens_used: completion.tokens_used,
                fallback: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::MockLlm;

    #[test]
    fn extract_json_handles_fences_and_prose() {
        let fenced = "```json\n{\"relevance\": 8}\n```";
        assert_eq!(extract_json(fenced).unwrap()["relevance"], 8);

        let prose = "Here is my evaluation: {\"relevance\": 9} hope it helps";
        assert_eq!(extract_json(prose).unwrap()["relevance"], 9);

        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{broken").is_none());
    }

    #[tokio::test]
    async fn weighted_scoring() {
        let llm: Arc<dyn LlmService> = Arc::new(MockLlm::scripted(vec![
            r#"{"relevance": 8, "coherence": 8, "completeness": 6, "readability": 6, "suggestions": ["tighten the intro"]}"#
                .to_string(),
        ]));
        let result = score(&llm, "article", "requirements", &CancellationToken::new())
            .await
            .unwrap();
        // 8*0.3 + 8*0.3 + 6*0.2 + 6*0.2 = 7.2
        assert!((result.score - 7.2).abs() < 1e-9);
        assert!(!result.fallback);
        assert_eq!(result.suggestions, vec!["tighten the intro"]);
    }

    #[tokio::test]
    async fn unparseable_reply_falls_back_neutral() {
        let llm: Arc<dyn LlmService> =
            Arc::new(MockLlm::scripted(vec!["I think it is pretty good!".to_string()]));
        let result = score(&llm, "article", "requirements", &CancellationToken::new())
            .await
            .unwrap();
        assert!((result.score - FALLBACK_SCORE).abs() < f64::EPSILON);
        assert!(result.fallback);
        assert!(result.suggestions.is_empty());
    }

    #[tokio::test]
    async fn missing_dimension_also_falls_back() {
        let llm: Arc<dyn LlmService> = Arc::new(MockLlm::scripted(vec![
            r#"{"relevance": 8, "coherence": 8}"#.to_string(),
        ]));
        let result = score(&llm, "article", "requirements", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.fallback);
    }

    #[tokio::test]
    async fn out_of_range_scores_clamped() {
        let llm: Arc<dyn LlmService> = Arc::new(MockLlm::scripted(vec![
            r#"{"relevance": 15, "coherence": -3, "completeness": 10, "readability": 10}"#
                .to_string(),
        ]));
        let result = score(&llm, "article", "requirements", &CancellationToken::new())
            .await
            .unwrap();
        // 10*0.3 + 0*0.3 + 10*0.2 + 10*0.2 = 7.0
        assert!((result.score - 7.0).abs() < 1e-9);
        assert!(!result.fallback);
    }
}
