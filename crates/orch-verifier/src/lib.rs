//! Verifier (spec §4.6): stateless, deterministic quality scoring of an
//! artifact against its originating task's quality criteria.
//!
//! Generalized from `chimera-layer3::safety_validator`/`compliance_validator`,
//! which scored a WASM agent's output against safety/compliance rules; here
//! the same "independent checks averaged into one score" shape scores an
//! LLM response against basic-quality, per-criterion, and failure-pattern
//! checks.

use orch_types::artifact::{Artifact, VerificationResult};
use orch_types::task::Task;
use regex::Regex;
use std::collections::HashMap;

pub const PASS_THRESHOLD: f64 = 0.7;
pub const REPAIR_THRESHOLD: f64 = 0.5;

const PLACEHOLDER_PATTERN: &str = r"(?i)^(todo|tbd|coming soon|not implemented|\.\.\.|…|error|failed|unable)$";

const POSITIVE_SYNONYMS: &[&str] = &["success", "done", "tested", "verified", "fixed", "complete", "completed", "passed"];

const APOLOGY_PHRASES: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "i apologize",
    "as an ai",
    "i cannot",
    "i can't",
    "i'm not able",
    "i am not able",
    "unable to help",
];

/// A task-kind-scoped custom validator, injected by the embedding
/// application (spec §4.6 item 4). Takes the artifact and task and returns
/// a score in `[0, 1]`.
pub type CustomValidator = Box<dyn Fn(&Artifact, &Task) -> f64 + Send + Sync>;

#[derive(Default)]
pub struct Verifier {
    custom_validators: HashMap<String, CustomValidator>,
    placeholder_re: Option<Regex>,
}

impl Verifier {
    pub fn new() -> Self {
        Self {
            custom_validators: HashMap::new(),
            placeholder_re: Regex::new(PLACEHOLDER_PATTERN).ok(),
        }
    }

    /// Registers a custom validator for a task kind (by its `as_str()` form).
    pub fn with_validator(mut self, task_kind: impl Into<String>, validator: CustomValidator) -> Self {
        self.custom_validators.insert(task_kind.into(), validator);
        self
    }

    /// Computes the overall verification result for `artifact` against the
    /// quality criteria declared on `task`. Deterministic given the same
    /// inputs.
    pub fn verify(&self, artifact: &Artifact, task: &Task) -> VerificationResult {
        let mut criteria = HashMap::new();
        let mut sub_scores = Vec::new();
        let mut suggested_fixes = Vec::new();

        let (basic_score, basic_outcomes) = self.basic_quality(artifact);
        for (name, ok) in basic_outcomes {
            if !ok {
                suggested_fixes.push(format!("response fails basic quality check: {name}"));
            }
            criteria.insert(name.to_string(), ok);
        }
        sub_scores.push(basic_score);

        if !task.quality_criteria.is_empty() {
            let mut criterion_scores = Vec::new();
            for criterion in &task.quality_criteria {
                let (score, passed) = self.evaluate_criterion(criterion, artifact);
                criteria.insert(criterion.clone(), passed);
                if !passed {
                    suggested_fixes.push(format!("criterion not satisfied: {criterion}"));
                }
                criterion_scores.push(score);
            }
            sub_scores.push(criterion_scores.iter().sum::<f64>() / criterion_scores.len() as f64);
        }

        let failure_score = self.failure_pattern_score(&artifact.response);
        if failure_score < 1.0 {
            suggested_fixes.push("response contains apology/refusal language".to_string());
        }
        sub_scores.push(failure_score);

        if let Some(validator) = self.custom_validators.get(task.kind.as_str()) {
            sub_scores.push(validator(artifact, task));
        }

        let score = sub_scores.iter().sum::<f64>() / sub_scores.len() as f64;
        let passed = score >= PASS_THRESHOLD;
        let needs_repair = score < REPAIR_THRESHOLD;

        let feedback = if passed {
            format!("passed with score {score:.2}")
        } else if suggested_fixes.is_empty() {
            format!("failed with score {score:.2}")
        } else {
            format!("failed with score {score:.2}: {}", suggested_fixes.join("; "))
        };

        VerificationResult {
            passed,
            score,
            criteria,
            feedback,
            needs_repair,
            fallback_recommended: score < REPAIR_THRESHOLD,
            suggested_fixes,
        }
    }

    /// Basic quality sub-score (spec §4.6 item 1): fraction of
    /// {length, not-placeholder, token-count} checks that pass.
    fn basic_quality(&self, artifact: &Artifact) -> (f64, [(&'static str, bool); 3]) {
        let length_ok = artifact.response.len() >= 10;
        let trimmed = artifact.response.trim();
        let not_placeholder = match &self.placeholder_re {
            Some(re) => !re.is_match(trimmed),
            None => true,
        };
        let tokens_ok = artifact.tokens.output_tokens >= 10;

        let outcomes = [
            ("min_length", length_ok),
            ("not_placeholder", not_placeholder),
            ("min_output_tokens", tokens_ok),
        ];
        let score = outcomes.iter().filter(|(_, ok)| *ok).count() as f64 / outcomes.len() as f64;
        (score, outcomes)
    }

    /// Interprets one quality criterion against the artifact's response
    /// (spec §4.6 item 2). Returns `(score, passed)`.
    fn evaluate_criterion(&self, criterion: &str, artifact: &Artifact) -> (f64, bool) {
        let response = &artifact.response;
        match criterion {
            "non-empty" => {
                let ok = !response.trim().is_empty();
                (if ok { 1.0 } else { 0.0 }, ok)
            }
            "coherent" => {
                let ok = response.split_whitespace().count() >= 10;
                (if ok { 1.0 } else { 0.0 }, ok)
            }
            other if other.starts_with("min-length-") => {
                let n: usize = other
                    .trim_start_matches("min-length-")
                    .parse()
                    .unwrap_or(0);
                let ok = response.len() >= n;
                (if ok { 1.0 } else { 0.0 }, ok)
            }
            free_form => {
                let lower = response.to_lowercase();
                let mentions_synonym = POSITIVE_SYNONYMS.iter().any(|s| lower.contains(s))
                    || lower.contains(&free_form.to_lowercase());
                if mentions_synonym {
                    (1.0, true)
                } else if response.len() > 100 {
                    (0.8, true)
                } else {
                    (0.0, false)
                }
            }
        }
    }

    /// Failure-pattern sub-score (spec §4.6 item 3): counts apology/refusal
    /// phrases and maps the count to a discrete score.
    fn failure_pattern_score(&self, response: &str) -> f64 {
        let lower = response.to_lowercase();
        let count = APOLOGY_PHRASES.iter().filter(|phrase| lower.contains(*phrase)).count();
        if count >= 3 {
            0.0
        } else if count >= 1 {
            0.5
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orch_types::artifact::TokenUsage;
    use orch_types::task::{Task, TaskKind};

    fn artifact(response: &str, output_tokens: u32) -> Artifact {
        Artifact {
            task_id: "t1".to_string(),
            provider_id: "m1".to_string(),
            prompt: "do it".to_string(),
            response: response.to_string(),
            tokens: TokenUsage { input_tokens: 10, output_tokens },
            latency_ms: 100,
            timestamp: Utc::now(),
            success: true,
            error: None,
            verification: None,
            repair_count: 0,
            fallback_of: None,
            cost: 0.001,
            cancelled_before_start: false,
        }
    }

    fn task(criteria: Vec<&str>) -> Task {
        let mut t = Task::new("t1", "desc", TaskKind::Generate);
        t.quality_criteria = criteria.into_iter().map(String::from).collect();
        t
    }

    #[test]
    fn good_response_passes() {
        let verifier = Verifier::new();
        let artifact = artifact(
            "The task completed successfully: all tests passed and the implementation is verified and working well.",
            30,
        );
        let result = verifier.verify(&artifact, &task(vec!["coherent"]));
        assert!(result.passed);
        assert!(!result.needs_repair);
    }

    #[test]
    fn empty_content_fails_and_needs_repair() {
        let verifier = Verifier::new();
        let artifact = artifact("", 0);
        let result = verifier.verify(&artifact, &task(vec!["non-empty"]));
        assert!(!result.passed);
        assert!(result.needs_repair);
    }

    #[test]
    fn placeholder_response_scores_low() {
        let verifier = Verifier::new();
        let artifact = artifact("TODO", 1);
        let result = verifier.verify(&artifact, &task(vec![]));
        assert!(!result.passed);
    }

    #[test]
    fn apology_heavy_response_triggers_failure_pattern() {
        let verifier = Verifier::new();
        let artifact = artifact(
            "I'm sorry, I cannot do that. I apologize, I am not able to help with this request at all here.",
            5,
        );
        let result = verifier.verify(&artifact, &task(vec![]));
        assert!(result.needs_repair);
    }

    #[test]
    fn min_length_criterion_parses_threshold() {
        let verifier = Verifier::new();
        let short = artifact("short", 5);
        let result = verifier.verify(&short, &task(vec!["min-length-100"]));
        assert_eq!(result.criteria.get("min-length-100"), Some(&false));
    }

    #[test]
    fn custom_validator_is_included_in_mean() {
        let verifier = Verifier::new().with_validator("generate", Box::new(|_artifact, _task| 0.0));
        let artifact = artifact(
            "A perfectly fine, coherent, reasonably long response with plenty of words in it here today.",
            25,
        );
        let result = verifier.verify(&artifact, &task(vec![]));
        assert!(result.score < 1.0);
    }
}
