//! Deterministic feedback synthesis for failed checks.

use craftflow_models::HardConstraints;

use super::hard_rules::{RuleOutcome, word_count};

/// Tiered revision guidance for a length violation.
///
/// Deviation tiers: ≤10% off-target asks for a touch-up, ≤25% a partial
/// rework, beyond that a rewrite.
fn length_suggestion(words: usize, constraints: &HardConstraints) -> Option<String> {
    let words = words as f64;
    let (target, direction) = match (constraints.min_words, constraints.max_words) {
        (Some(min), _) if words < min as f64 => (min as f64, "expand"),
        (_, Some(max)) if words > max as f64 => (max as f64, "trim"),
        _ => return None,
    };
    let deviation = ((words - target).abs() / target).abs();
    let guidance = if deviation <= 0.10 {
        format!(
            "{direction} the text slightly (about {:.0} words off target); small edits to a few sentences are enough",
            (words - target).abs()
        )
    } else if deviation <= 0.25 {
        format!(
            "{direction} the text moderately (about {:.0} words off target); rework the thinnest or most verbose sections",
            (words - target).abs()
        )
    } else {
        format!(
            "{direction} the text substantially (about {:.0} words off target); restructure the piece rather than patching sentences",
            (words - target).abs()
        )
    };
    Some(guidance)
}

/// Build the ordered, de-duplicated suggestion list for a failed gate.
pub fn synthesize(
    artifact: &str,
    constraints: &HardConstraints,
    rule_outcomes: &[RuleOutcome],
    llm_suggestions: &[String],
) -> Vec<String> {
    let mut suggestions: Vec<String> = Vec::new();

    for outcome in rule_outcomes.iter().filter(|o| !o.passed) {
        match outcome.rule.as_str() {
            "length" => {
                if let Some(tip) = length_suggestion(word_count(artifact), constraints) {
                    suggestions.push(tip);
                }
            }
            "keywords" => {
                suggestions.push(format!(
                    "incorporate the missing required keywords ({})",
                    outcome
                        .diagnosis
                        .split(':')
                        .nth(1)
                        .unwrap_or("")
                        .trim()
                ));
            }
            _ => suggestions.push(outcome.diagnosis.clone()),
        }
    }

    suggestions.extend(llm_suggestions.iter().cloned());

    // De-duplicate, first occurrence wins.
    let mut seen = std::collections::HashSet::new();
    suggestions.retain(|s| seen.insert(s.clone()));
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::hard_rules::evaluate;

    fn constraints() -> HardConstraints {
        HardConstraints {
            min_words: Some(100),
            max_words: Some(200),
            required_keywords: vec!["AI".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn tiered_length_guidance() {
        let constraints = constraints();
        // 95 words: ~5% below minimum → small revision.
        let tip = length_suggestion(95, &constraints).unwrap();
        assert!(tip.contains("slightly"));

        // 80 words: 20% below → medium revision.
        let tip = length_suggestion(80, &constraints).unwrap();
        assert!(tip.contains("moderately"));

        // 40 words: 60% below → heavy revision.
        let tip = length_suggestion(40, &constraints).unwrap();
        assert!(tip.contains("substantially"));

        // 300 words: over maximum → trim.
        let tip = length_suggestion(300, &constraints).unwrap();
        assert!(tip.starts_with("trim"));

        // In range: no suggestion.
        assert!(length_suggestion(150, &constraints).is_none());
    }

    #[test]
    fn synthesis_merges_and_dedupes() {
        let constraints = constraints();
        let artifact = "short text without the keyword";
        let outcomes = evaluate(artifact, &constraints);
        let llm = vec![
            "tighten the intro".to_string(),
            "tighten the intro".to_string(),
        ];

        let suggestions = synthesize(artifact, &constraints, &outcomes, &llm);
        assert!(suggestions.iter().any(|s| s.contains("expand")));
        assert!(suggestions.iter().any(|s| s.contains("AI")));
        assert_eq!(
            suggestions
                .iter()
                .filter(|s| s.as_str() == "tighten the intro")
                .count(),
            1
        );
    }

    #[test]
    fn passing_rules_produce_no_suggestions() {
        let constraints = HardConstraints::default();
        let outcomes = evaluate("anything", &constraints);
        let suggestions = synthesize("anything", &constraints, &outcomes, &[]);
        assert!(suggestions.is_empty());
    }
}
