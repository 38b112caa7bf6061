//! Planner port implementation. `MockPlanner` ships two paths:
//!
//! - a JSON path: when given text that looks like a DAG (possibly wrapped
//!   in markdown fences or slightly malformed, as an LLM's output often
//!   is), auto-repairs and parses it against the DAG schema;
//! - a heuristic path: otherwise, decomposes free text into a small
//!   sequential DAG by splitting on numbered steps or sentence boundaries
//!   and classifying each step's task kind by keyword.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use orch_types::dag::Dag;
use orch_types::planner::{PlanError, Planner};
use orch_types::task::{Edge, Requirements, Task, TaskKind};

pub struct MockPlanner;

#[async_trait]
impl Planner for MockPlanner {
    async fn plan(&self, user_text: &str) -> Result<Dag, PlanError> {
        let trimmed = user_text.trim();
        if looks_like_json(trimmed) {
            return parse_dag_json(trimmed);
        }
        Ok(decompose_heuristically(trimmed))
    }
}

fn looks_like_json(text: &str) -> bool {
    let stripped = strip_markdown_fences(text);
    stripped.trim_start().starts_with('{')
}

/// JSON auto-repair: strips markdown code fences, extracts the first
/// balanced `{...}` block, balances any remaining unmatched brackets, and
/// strips trailing commas before deserializing against the DAG schema.
pub fn parse_dag_json(text: &str) -> Result<Dag, PlanError> {
    let stripped = strip_markdown_fences(text);
    let start = stripped.find('{').ok_or_else(|| PlanError::InvalidJson("no JSON object found".to_string()))?;
    // A fully balanced object (possibly followed by trailing garbage) is
    // preferred; a truncated one never closes, so fall back to everything
    // from the first `{` onward and let `balance_brackets` close it.
    let candidate = extract_balanced_object(&stripped).unwrap_or_else(|| stripped[start..].to_string());
    let balanced = balance_brackets(&candidate);
    let cleaned = strip_trailing_commas(&balanced);

    let dag: Dag = serde_json::from_str(&cleaned).map_err(|err| PlanError::InvalidJson(err.to_string()))?;
    dag.validate_structure().map_err(|err| PlanError::SchemaMismatch(err.to_string()))?;
    Ok(dag)
}

fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches("json").trim_start_matches('\n');
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

/// Scans for the first `{` and returns the substring up to its matching
/// `}`, tolerating braces inside string literals.
fn extract_balanced_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        let ch = byte as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Appends any closing brackets needed to balance unmatched `{`/`[` left
/// over after truncated planner output.
fn balance_brackets(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut result = text.to_string();
    while let Some(closer) = stack.pop() {
        result.push(closer);
    }
    result
}

/// Removes trailing commas before a closing `}`/`]`, which well-known LLMs
/// frequently emit and which `serde_json` rejects outright.
fn strip_trailing_commas(text: &str) -> String {
    static TRAILING_COMMA: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r",\s*([}\]])").unwrap());
    TRAILING_COMMA.replace_all(text, "$1").to_string()
}

struct TaskKeywords {
    kind: TaskKind,
    keywords: &'static [&'static str],
}

static TASK_KEYWORDS: &[TaskKeywords] = &[
    TaskKeywords { kind: TaskKind::Transform, keywords: &["code", "implement", "function", "refactor", "debug", "script", "transform", "convert"] },
    TaskKeywords { kind: TaskKind::Reason, keywords: &["analyze", "solve", "calculate", "prove", "reason", "deduce", "infer"] },
    TaskKeywords { kind: TaskKind::Summarize, keywords: &["summarize", "summary", "condense", "brief", "overview", "tldr"] },
    TaskKeywords { kind: TaskKind::Synthesize, keywords: &["combine", "synthesize", "merge", "consolidate"] },
];

fn classify(text: &str) -> TaskKind {
    let lower = text.to_lowercase();
    let mut best: Option<(TaskKind, usize)> = None;
    for group in TASK_KEYWORDS {
        let score = group.keywords.iter().filter(|kw| lower.contains(*kw)).count();
        if score > 0 && best.map(|(_, best_score)| score > best_score).unwrap_or(true) {
            best = Some((group.kind, score));
        }
    }
    best.map(|(kind, _)| kind).unwrap_or(TaskKind::Generate)
}

fn extract_criteria(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut criteria = Vec::new();
    if lower.contains("should") {
        criteria.push("coherent".to_string());
    }
    if ["test", "verify", "check"].iter().any(|w| lower.contains(w)) {
        criteria.push("non-empty".to_string());
    }
    if criteria.is_empty() {
        criteria.push("non-empty".to_string());
    }
    criteria
}

const NUMBERED_STEP: &str = r"(?m)^\s*\d+[\.)]\s+(.+)$";
const DEPENDENCY_WORDS: &[&str] = &["then", "after", "next", "finally"];

fn decompose_heuristically(prompt: &str) -> Dag {
    static NUMBERED_RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(NUMBERED_STEP).unwrap());

    let steps: Vec<String> = NUMBERED_RE
        .captures_iter(prompt)
        .map(|c| c[1].trim().to_string())
        .collect();

    let steps = if !steps.is_empty() {
        steps
    } else {
        prompt
            .split(|c| c == '.' || c == '!' || c == '?')
            .map(|s| s.trim().to_string())
            .filter(|s| s.split_whitespace().count() >= 3)
            .collect()
    };

    let steps = if steps.is_empty() { vec![prompt.to_string()] } else { steps };

    let mut tasks = Vec::new();
    let mut edges = Vec::new();
    let mut previous_id: Option<String> = None;

    for (idx, step) in steps.iter().enumerate() {
        let id = format!("t{}", idx + 1);
        let kind = classify(step);
        let mut task = Task::new(&id, step.clone(), kind);
        task.requirements = Requirements {
            capability: kind.as_str().to_string(),
            min_quality: 0.7,
            required_features: Vec::new(),
            context_tokens: None,
        };
        task.quality_criteria = extract_criteria(step);

        let has_dependency_word = DEPENDENCY_WORDS.iter().any(|w| step.to_lowercase().contains(w));
        if let Some(prev) = &previous_id {
            if steps.len() == 1 || has_dependency_word || !NUMBERED_RE.is_match(prompt) {
                // Sequential by default: each step depends on the previous one,
                // matching the original planner's "previous_task_id" chaining
                // for both the numbered-step and sentence-split paths.
                edges.push(Edge::new(prev.clone(), id.clone()));
            }
        }
        previous_id = Some(id.clone());
        tasks.push(task);
    }

    Dag::new(tasks, edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_sentence_produces_one_task() {
        let planner = MockPlanner;
        let dag = planner.plan("Write a haiku about the ocean").await.unwrap();
        assert_eq!(dag.tasks.len(), 1);
    }

    #[tokio::test]
    async fn numbered_steps_produce_linear_chain() {
        let planner = MockPlanner;
        let text = "1. Research the topic thoroughly\n2. Write a detailed draft\n3. Edit and polish the draft";
        let dag = planner.plan(text).await.unwrap();
        assert_eq!(dag.tasks.len(), 3);
        assert_eq!(dag.edges.len(), 2);
    }

    #[tokio::test]
    async fn classifies_coding_keywords_as_transform() {
        let planner = MockPlanner;
        let dag = planner.plan("Implement a function that parses CSV files").await.unwrap();
        assert_eq!(dag.tasks[0].kind, TaskKind::Transform);
    }

    #[test]
    fn json_auto_repair_strips_fences_and_trailing_commas() {
        let text = "```json\n{\"tasks\": [{\"id\": \"a\", \"description\": \"x\", \"kind\": \"generate\",},], \"edges\": [],}\n```";
        let dag = parse_dag_json(text).unwrap();
        assert_eq!(dag.tasks.len(), 1);
        assert_eq!(dag.tasks[0].id, "a");
    }

    #[test]
    fn json_auto_repair_balances_truncated_brackets() {
        let text = "{\"tasks\": [{\"id\": \"a\", \"description\": \"x\", \"kind\": \"generate\"";
        let result = parse_dag_json(text);
        assert!(result.is_ok(), "expected bracket-balancing to recover a parseable object: {result:?}");
    }

    #[test]
    fn malformed_json_without_braces_is_rejected() {
        let result = parse_dag_json("not json at all");
        assert!(result.is_err());
    }
}
