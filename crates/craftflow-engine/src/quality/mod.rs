//! The quality gate: hard rules, soft score, feedback synthesis.

pub mod feedback;
pub mod hard_rules;
pub mod soft_score;

use std::sync::Arc;

use craftflow_models::{HardConstraints, QualityReport, now_ms};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::NodeError;
use crate::services::LlmService;

pub const RUBRIC_VERSION: &str = "v2";

/// Decides whether a generated artifact is acceptable, or must be
/// regenerated with targeted feedback.
pub struct QualityGate {
    llm: Arc<dyn LlmService>,
    threshold: f64,
}

impl QualityGate {
    pub fn new(llm: Arc<dyn LlmService>, threshold: f64) -> Self {
        Self { llm, threshold }
    }

    /// Full two-phase check of a text artifact.
    ///
    /// Hard rules run first and are decisive: any failure forces
    /// `passed=false` whatever the soft score says. The soft score still
    /// runs so its suggestions feed the rewrite.
    pub async fn check_text(
        &self,
        phase: &str,
        artifact: &str,
        requirements: &str,
        constraints: &HardConstraints,
        cancel: &CancellationToken,
    ) -> Result<QualityReport, NodeError> {
        let rule_outcomes = hard_rules::evaluate(artifact, constraints);
        let hard_ok = hard_rules::all_passed(&rule_outcomes);

        let soft = soft_score::score(&self.llm, artifact, requirements, cancel)
            .await
            .map_err(NodeError::from)?;

        let passed = hard_ok && soft.score >= self.threshold;
        let suggestions = if passed {
            vec![]
        } else {
            feedback::synthesize(artifact, constraints, &rule_outcomes, &soft.suggestions)
        };

        Ok(QualityReport {
            phase: phase.to_string(),
            score: soft.score,
            passed,
            hard_constraints_passed: hard_ok,
            details: json!({
                "rules": rule_outcomes,
                "dimensions": soft.dimensions,
                "wordCount": hard_rules::word_count(artifact),
                "threshold": self.threshold,
                "softFallback": soft.fallback,
                "tokensUsed": soft.tokens_used,
            }),
            fix_suggestions: suggestions,
            rubric_version: RUBRIC_VERSION.to_string(),
            model_name: Some(soft.model_name),
            checked_at: now_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mock::MockLlm;

    const GOOD_EVAL: &str = r#"{"relevance": 9, "coherence": 9, "completeness": 8, "readability": 8, "suggestions": []}"#;
    const BAD_EVAL: &str = r#"{"relevance": 4, "coherence": 4, "completeness": 4, "readability": 4, "suggestions": ["stay on topic"]}"#;

    fn gate(script: Vec<String>) -> QualityGate {
        QualityGate::new(Arc::new(MockLlm::scripted(script)), 7.0)
    }

    #[tokio::test]
    async fn passes_when_hard_and_soft_pass() {
        let gate = gate(vec![GOOD_EVAL.to_string()]);
        let constraints = HardConstraints {
            required_keywords: vec!["AI".to_string()],
            ..Default::default()
        };
        let report = gate
            .check_text(
                "text",
                "AI is reshaping industries",
                "write about AI",
                &constraints,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.passed);
        assert!(report.hard_constraints_passed);
        assert!(report.fix_suggestions.is_empty());
    }

    #[tokio::test]
    async fn hard_failure_overrides_soft_score() {
        let gate = gate(vec![GOOD_EVAL.to_string()]);
        let constraints = HardConstraints {
            required_keywords: vec!["missing-keyword".to_string()],
            ..Default::default()
        };
        let report = gate
            .check_text(
                "text",
                "content without it",
                "requirements",
                &constraints,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!report.passed);
        assert!(!report.hard_constraints_passed);
        // Soft score was fine; the hard rule decided.
        assert!(report.score >= 7.0);
        assert!(!report.fix_suggestions.is_empty());
    }

    #[tokio::test]
    async fn soft_failure_produces_suggestions() {
        let gate = gate(vec![BAD_EVAL.to_string()]);
        let report = gate
            .check_text(
                "text",
                "weak content",
                "requirements",
                &HardConstraints::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!report.passed);
        assert!(report.hard_constraints_passed);
        assert!(report.fix_suggestions.contains(&"stay on topic".to_string()));
    }

    #[tokio::test]
    async fn garbage_evaluator_reply_is_neutral_pass() {
        let gate = gate(vec!["total nonsense".to_string()]);
        let report = gate
            .check_text(
                "text",
                "content",
                "requirements",
                &HardConstraints::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // Neutral 7.0 meets the default threshold.
        assert!(report.passed);
        assert_eq!(report.details["softFallback"], true);
    }
}
