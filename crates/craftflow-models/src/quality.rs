//! Quality-gate artifacts: constraints in, reports out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::now_ms;

fn default_conclusion_markers() -> Vec<String> {
    [
        "总结",
        "结论",
        "结语",
        "Conclusion",
        "In conclusion",
        "Summary",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Deterministic constraints the hard-rule checker enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardConstraints {
    pub min_words: Option<u32>,
    pub max_words: Option<u32>,
    #[serde(default, alias = "keywords")]
    pub required_keywords: Vec<String>,
    #[serde(default)]
    pub forbidden_words: Vec<String>,
    /// Minimum number of sections (paragraphs) for article checks.
    pub min_sections: Option<u32>,
    /// Whether a level-1 heading is required.
    #[serde(default)]
    pub require_heading: bool,
    /// One of these must appear when conclusion checking is on.
    #[serde(default = "default_conclusion_markers")]
    pub conclusion_markers: Vec<String>,
    /// Whether a conclusion marker is required.
    #[serde(default)]
    pub require_conclusion: bool,
}

impl Default for HardConstraints {
    fn default() -> Self {
        Self {
            min_words: None,
            max_words: None,
            required_keywords: vec![],
            forbidden_words: vec![],
            min_sections: None,
            require_heading: false,
            conclusion_markers: default_conclusion_markers(),
            require_conclusion: false,
        }
    }
}

/// Outcome of one check run. Append-only history per task and phase;
/// the most recent row is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    /// `text`, `image`, `translation`, or a custom phase name.
    pub phase: String,
    /// Weighted soft score on a 0–10 scale.
    pub score: f64,
    /// Overall verdict. Any hard-rule failure forces `false`.
    pub passed: bool,
    pub hard_constraints_passed: bool,
    /// Structured findings (per-rule outcomes, per-dimension scores).
    pub details: Value,
    /// Ordered, de-duplicated, human-readable improvement guidance.
    #[serde(default)]
    pub fix_suggestions: Vec<String>,
    pub rubric_version: String,
    pub model_name: Option<String>,
    pub checked_at: i64,
}

impl QualityReport {
    /// A passing report with nothing checked, used when a phase has no
    /// artifact to evaluate (e.g. no images were requested).
    pub fn empty_pass(phase: &str, rubric_version: &str) -> Self {
        Self {
            phase: phase.to_string(),
            score: 10.0,
            passed: true,
            hard_constraints_passed: true,
            details: Value::Object(Default::default()),
            fix_suggestions: vec![],
            rubric_version: rubric_version.to_string(),
            model_name: None,
            checked_at: now_ms(),
        }
    }
}
