//! Hard rules: pure-function validators over an artifact.
//!
//! Every rule reports an atomic pass/fail plus a human-readable diagnosis.
//! Any failure here forces the overall gate verdict to `false`, regardless
//! of the soft score.

use craftflow_models::HardConstraints;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleOutcome {
    pub rule: String,
    pub passed: bool,
    pub diagnosis: String,
}

impl RuleOutcome {
    fn pass(rule: &str, diagnosis: String) -> Self {
        Self {
            rule: rule.to_string(),
            passed: true,
            diagnosis,
        }
    }

    fn fail(rule: &str, diagnosis: String) -> Self {
        Self {
            rule: rule.to_string(),
            passed: false,
            diagnosis,
        }
    }
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
    )
}

/// CJK-aware word counting: han characters count individually, everything
/// else by whitespace-delimited runs.
pub fn word_count(text: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    for ch in text.chars() {
        if is_cjk(ch) {
            if in_word {
                count += 1;
                in_word = false;
            }
            count += 1;
        } else if ch.is_alphanumeric() {
            in_word = true;
        } else if in_word {
            count += 1;
            in_word = false;
        }
    }
    if in_word {
        count += 1;
    }
    count
}

/// Sections are blocks separated by blank lines.
pub fn section_count(text: &str) -> usize {
    text.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .count()
}

pub fn has_level1_heading(text: &str) -> bool {
    text.lines()
        .any(|line| line.starts_with("# ") && line.len() > 2)
}

/// Run every configured rule over `artifact`.
pub fn evaluate(artifact: &str, constraints: &HardConstraints) -> Vec<RuleOutcome> {
    let mut outcomes = Vec::new();
    let words = word_count(artifact);

    if constraints.min_words.is_some() || constraints.max_words.is_some() {
        let min = constraints.min_words.unwrap_or(0);
        let max = constraints.max_words.unwrap_or(u32::MAX);
        if (words as u32) < min {
            outcomes.push(RuleOutcome::fail(
                "length",
                format!("word count {words} is below the minimum of {min}"),
            ));
        } else if (words as u32) > max {
            outcomes.push(RuleOutcome::fail(
                "length",
                format!("word count {words} exceeds the maximum of {max}"),
            ));
        } else {
            outcomes.push(RuleOutcome::pass(
                "length",
                format!("word count {words} is within [{min}, {max}]"),
            ));
        }
    }

    if !constraints.required_keywords.is_empty() {
        let missing: Vec<&str> = constraints
            .required_keywords
            .iter()
            .filter(|kw| !artifact.contains(kw.as_str()))
            .map(|kw| kw.as_str())
            .collect();
        if missing.is_empty() {
            outcomes.push(RuleOutcome::pass(
                "keywords",
                "all required keywords present".to_string(),
            ));
        } else {
            outcomes.push(RuleOutcome::fail(
                "keywords",
                format!("missing required keywords: {}", missing.join(", ")),
            ));
        }
    }

    if !constraints.forbidden_words.is_empty() {
        let found: Vec<&str> = constraints
            .forbidden_words
            .iter()
            .filter(|w| artifact.contains(w.as_str()))
            .map(|w| w.as_str())
            .collect();
        if found.is_empty() {
            outcomes.push(RuleOutcome::pass(
                "forbiddenWords",
                "no forbidden words present".to_string(),
            ));
        } else {
            outcomes.push(RuleOutcome::fail(
                "forbiddenWords",
                format!("forbidden words present: {}", found.join(", ")),
            ));
        }
    }

    if constraints.require_heading {
        if has_level1_heading(artifact) {
            outcomes.push(RuleOutcome::pass(
                "heading",
                "level-1 heading present".to_string(),
            ));
        } else {
            outcomes.push(RuleOutcome::fail(
                "heading",
                "missing a level-1 heading".to_string(),
            ));
        }
    }

    if constraints.require_conclusion {
        let found = constraints
            .conclusion_markers
            .iter()
            .any(|marker| artifact.contains(marker.as_str()));
        if found {
            outcomes.push(RuleOutcome::pass(
                "conclusion",
                "conclusion marker present".to_string(),
            ));
        } else {
            outcomes.push(RuleOutcome::fail(
                "conclusion",
                format!(
                    "missing a conclusion marker (one of: {})",
                    constraints.conclusion_markers.join(", ")
                ),
            ));
        }
    }

    if let Some(min_sections) = constraints.min_sections {
        let sections = section_count(artifact);
        if (sections as u32) >= min_sections {
            outcomes.push(RuleOutcome::pass(
                "sections",
                format!("{sections} sections, minimum {min_sections}"),
            ));
        } else {
            outcomes.push(RuleOutcome::fail(
                "sections",
                format!("only {sections} sections, minimum {min_sections}"),
            ));
        }
    }

    outcomes
}

pub fn all_passed(outcomes: &[RuleOutcome]) -> bool {
    outcomes.iter().all(|o| o.passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_count_mixed_scripts() {
        assert_eq!(word_count("hello world"), 2);
        assert_eq!(word_count("人工智能"), 4);
        assert_eq!(word_count("AI 技术的发展"), 6);
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("one, two; three."), 3);
    }

    #[test]
    fn length_bounds_inclusive() {
        let constraints = HardConstraints {
            min_words: Some(2),
            max_words: Some(2),
            ..Default::default()
        };
        let outcomes = evaluate("hello world", &constraints);
        assert!(all_passed(&outcomes));

        let outcomes = evaluate("hello", &constraints);
        assert!(!all_passed(&outcomes));
        assert!(outcomes[0].diagnosis.contains("below the minimum"));
    }

    #[test]
    fn keywords_case_sensitive_substrings() {
        let constraints = HardConstraints {
            required_keywords: vec!["AI".to_string(), "人工智能".to_string()],
            ..Default::default()
        };
        let outcomes = evaluate("AI 与人工智能的未来", &constraints);
        assert!(all_passed(&outcomes));

        let outcomes = evaluate("ai 与人工智能的未来", &constraints);
        assert!(!all_passed(&outcomes));
        assert!(outcomes[0].diagnosis.contains("AI"));
    }

    #[test]
    fn forbidden_words_fail() {
        let constraints = HardConstraints {
            forbidden_words: vec!["lorem".to_string()],
            ..Default::default()
        };
        assert!(all_passed(&evaluate("clean text", &constraints)));
        assert!(!all_passed(&evaluate("some lorem ipsum", &constraints)));
    }

    #[test]
    fn structure_rules() {
        let constraints = HardConstraints {
            require_heading: true,
            require_conclusion: true,
            min_sections: Some(2),
            ..Default::default()
        };
        let article = "# 标题\n\n正文第一段。\n\n总结：就这样。";
        assert!(all_passed(&evaluate(article, &constraints)));

        let flat = "no heading here, single paragraph";
        let outcomes = evaluate(flat, &constraints);
        assert_eq!(outcomes.iter().filter(|o| !o.passed).count(), 3);
    }

    #[test]
    fn section_counting_ignores_blank_blocks() {
        assert_eq!(section_count("a\n\n\n\nb"), 2);
        assert_eq!(section_count("single"), 1);
        assert_eq!(section_count("  \n\n  "), 0);
    }
}
