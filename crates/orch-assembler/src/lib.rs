//! Assembler (spec §4.9): merges per-task artifacts into one `AssembledResponse`
//! per a configured strategy.
//!
//! Generalized from `chimera-layer3::validation_service`'s "aggregate
//! independent check results into one verdict" shape, except here the
//! inputs are provider artifacts rather than compliance checks and the
//! output is user-facing text rather than a pass/fail verdict.

use orch_types::artifact::Artifact;
use orch_types::response::AssembledResponse;
use orch_types::task::{Task, TaskId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStrategy {
    Concatenate,
    BestSingle,
    Synthesize,
    Consensus,
}

impl Default for AssemblyStrategy {
    fn default() -> Self {
        AssemblyStrategy::Concatenate
    }
}

/// Groups artifacts by task id, preserving the order artifacts arrive in
/// (primary, then repairs/fallback) so `best_of` can prefer the latest
/// passing attempt when several exist for one task.
fn group_by_task<'a>(artifacts: &'a [Artifact]) -> HashMap<&'a str, Vec<&'a Artifact>> {
    let mut grouped: HashMap<&str, Vec<&Artifact>> = HashMap::new();
    for artifact in artifacts {
        grouped.entry(artifact.task_id.as_str()).or_default().push(artifact);
    }
    grouped
}

/// Composite quality used by `best-single`/`synthesize`: verification score
/// plus small bonuses for output volume and low latency, capped at 1.0.
fn composite_quality(artifact: &Artifact) -> f64 {
    let base = artifact
        .verification
        .as_ref()
        .map(|v| v.score)
        .unwrap_or(0.0);
    let volume_bonus = (artifact.tokens.output_tokens as f64 / 2000.0).min(0.1);
    let latency_bonus = if artifact.latency_ms < 2000 { 0.05 } else { 0.0 };
    (base + volume_bonus + latency_bonus).min(1.0)
}

/// Picks the best artifact within one task's group by composite quality,
/// falling back to the first entry if none verified.
fn best_of<'a>(group: &[&'a Artifact]) -> &'a Artifact {
    group
        .iter()
        .copied()
        .max_by(|a, b| composite_quality(a).partial_cmp(&composite_quality(b)).unwrap_or(std::cmp::Ordering::Equal))
        .expect("group is non-empty")
}

pub struct Assembler {
    strategy: AssemblyStrategy,
}

impl Assembler {
    pub fn new(strategy: AssemblyStrategy) -> Self {
        Self { strategy }
    }

    /// Assembles `artifacts` (every attempt recorded for every task, in
    /// arrival order) against `tasks` (for descriptions, ordering) into one
    /// response per the configured strategy.
    pub fn assemble(&self, tasks: &[Task], artifacts: &[Artifact]) -> AssembledResponse {
        let grouped = group_by_task(artifacts);
        let successful: Vec<&Task> = tasks
            .iter()
            .filter(|t| grouped.get(t.id.as_str()).map(|g| g.iter().any(|a| a.success)).unwrap_or(false))
            .collect();

        if successful.is_empty() {
            return self.all_failed_response(tasks, artifacts);
        }

        match self.strategy {
            AssemblyStrategy::Concatenate => self.concatenate(tasks, &grouped),
            AssemblyStrategy::BestSingle => self.best_single(&grouped),
            AssemblyStrategy::Synthesize | AssemblyStrategy::Consensus => self.synthesize(tasks, &grouped),
        }
    }

    fn concatenate(&self, tasks: &[Task], grouped: &HashMap<&str, Vec<&Artifact>>) -> AssembledResponse {
        let mut sections = Vec::new();
        let mut source_ids = Vec::new();
        let mut confidences = Vec::new();

        for task in tasks {
            let Some(group) = grouped.get(task.id.as_str()) else { continue };
            let winning = group.iter().copied().filter(|a| a.success).last();
            let Some(artifact) = winning else { continue };
            sections.push(format!("## {}\n\n{}", task.description, artifact.response));
            source_ids.push(artifact_id(artifact));
            confidences.push(artifact.verification.as_ref().map(|v| v.score).unwrap_or(0.0));
        }

        let output = sections.join("\n\n---\n\n");
        let confidence = mean(&confidences);

        AssembledResponse {
            output,
            source_artifact_ids: source_ids,
            confidence,
            method: orch_types::response::AssemblyMethod::Concatenate,
            metadata: HashMap::new(),
        }
    }

    fn best_single(&self, grouped: &HashMap<&str, Vec<&Artifact>>) -> AssembledResponse {
        let candidates: Vec<&Artifact> = grouped.values().flat_map(|g| g.iter().copied().filter(|a| a.success)).collect();
        let best = candidates
            .iter()
            .copied()
            .max_by(|a, b| composite_quality(a).partial_cmp(&composite_quality(b)).unwrap_or(std::cmp::Ordering::Equal))
            .expect("caller guarantees at least one success");

        AssembledResponse {
            output: best.response.clone(),
            source_artifact_ids: vec![artifact_id(best)],
            confidence: composite_quality(best),
            method: orch_types::response::AssemblyMethod::BestSingle,
            metadata: HashMap::new(),
        }
    }

    fn synthesize(&self, tasks: &[Task], grouped: &HashMap<&str, Vec<&Artifact>>) -> AssembledResponse {
        let mut sections = Vec::new();
        let mut source_ids = Vec::new();
        let mut confidences = Vec::new();
        let mut synthesized_count = 0usize;

        for task in tasks {
            let Some(group) = grouped.get(task.id.as_str()) else { continue };
            let successful: Vec<&Artifact> = group.iter().copied().filter(|a| a.success).collect();
            if successful.is_empty() {
                continue;
            }
            let chosen = if successful.len() == 1 {
                successful[0]
            } else {
                synthesized_count += 1;
                best_of(&successful)
            };
            sections.push(format!("## {}\n\n{}", task.description, chosen.response));
            source_ids.push(artifact_id(chosen));
            confidences.push(composite_quality(chosen));
        }

        let mut metadata = HashMap::new();
        metadata.insert("synthesized_task_count".to_string(), synthesized_count.to_string());

        AssembledResponse {
            output: sections.join("\n\n---\n\n"),
            source_artifact_ids: source_ids,
            confidence: mean(&confidences),
            method: orch_types::response::AssemblyMethod::Synthesize,
            metadata,
        }
    }

    fn all_failed_response(&self, tasks: &[Task], artifacts: &[Artifact]) -> AssembledResponse {
        let mut lines = vec!["all tasks failed to produce a usable artifact:".to_string()];
        let by_task: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        for artifact in artifacts {
            if artifact.success {
                continue;
            }
            let description = by_task.get(artifact.task_id.as_str()).map(|t| t.description.as_str()).unwrap_or("");
            let error = artifact.error.as_deref().unwrap_or("unknown error");
            lines.push(format!("- {} ({}): {}", artifact.task_id, description, error));
        }

        AssembledResponse {
            output: lines.join("\n"),
            source_artifact_ids: Vec::new(),
            confidence: 0.0,
            method: orch_types::response::AssemblyMethod::Concatenate,
            metadata: HashMap::new(),
        }
    }
}

fn artifact_id(artifact: &Artifact) -> TaskId {
    format!("{}:{}:{}", artifact.task_id, artifact.provider_id, artifact.repair_count)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orch_types::artifact::{TokenUsage, VerificationResult};
    use orch_types::task::TaskKind;

    fn passing_verification(score: f64) -> VerificationResult {
        VerificationResult {
            passed: score >= 0.7,
            score,
            criteria: HashMap::new(),
            feedback: String::new(),
            needs_repair: score < 0.5,
            fallback_recommended: score < 0.5,
            suggested_fixes: Vec::new(),
        }
    }

    fn artifact(task_id: &str, response: &str, score: f64, output_tokens: u32, latency_ms: u64) -> Artifact {
        Artifact {
            task_id: task_id.to_string(),
            provider_id: "m1".to_string(),
            prompt: String::new(),
            response: response.to_string(),
            tokens: TokenUsage { input_tokens: 10, output_tokens },
            latency_ms,
            timestamp: Utc::now(),
            success: true,
            error: None,
            verification: Some(passing_verification(score)),
            repair_count: 0,
            fallback_of: None,
            cost: 0.001,
            cancelled_before_start: false,
        }
    }

    fn task(id: &str) -> Task {
        Task::new(id, format!("task {id}"), TaskKind::Generate)
    }

    #[test]
    fn concatenate_joins_sections_with_divider() {
        let tasks = vec![task("a"), task("b")];
        let artifacts = vec![artifact("a", "first", 0.9, 100, 500), artifact("b", "second", 0.9, 100, 500)];
        let assembler = Assembler::new(AssemblyStrategy::Concatenate);
        let response = assembler.assemble(&tasks, &artifacts);
        assert!(response.output.contains("first"));
        assert!(response.output.contains("second"));
        assert!(response.output.contains("---"));
        assert_eq!(response.source_artifact_ids.len(), 2);
    }

    #[test]
    fn best_single_picks_highest_composite_quality() {
        let tasks = vec![task("a"), task("b")];
        let artifacts = vec![artifact("a", "mediocre", 0.7, 10, 5000), artifact("b", "great", 0.95, 500, 100)];
        let assembler = Assembler::new(AssemblyStrategy::BestSingle);
        let response = assembler.assemble(&tasks, &artifacts);
        assert_eq!(response.output, "great");
    }

    #[test]
    fn synthesize_picks_best_of_multiple_attempts_per_task() {
        let tasks = vec![task("a")];
        let mut weak = artifact("a", "weak attempt", 0.5, 10, 3000);
        weak.repair_count = 0;
        let mut strong = artifact("a", "strong attempt", 0.9, 50, 500);
        strong.repair_count = 1;
        let artifacts = vec![weak, strong];
        let assembler = Assembler::new(AssemblyStrategy::Synthesize);
        let response = assembler.assemble(&tasks, &artifacts);
        assert!(response.output.contains("strong attempt"));
        assert_eq!(response.metadata.get("synthesized_task_count").map(String::as_str), Some("1"));
    }

    #[test]
    fn all_failed_produces_zero_confidence_error_summary() {
        let tasks = vec![task("a")];
        let mut failed = artifact("a", "", 0.0, 0, 0);
        failed.success = false;
        failed.error = Some("provider timed out".to_string());
        let assembler = Assembler::new(AssemblyStrategy::Concatenate);
        let response = assembler.assemble(&tasks, &[failed]);
        assert_eq!(response.confidence, 0.0);
        assert!(response.output.contains("provider timed out"));
    }

    #[test]
    fn consensus_behaves_as_synthesize() {
        let tasks = vec![task("a")];
        let artifacts = vec![artifact("a", "only one", 0.8, 50, 500)];
        let assembler = Assembler::new(AssemblyStrategy::Consensus);
        let response = assembler.assemble(&tasks, &artifacts);
        assert_eq!(response.output, "## task a\n\nonly one");
    }
}
