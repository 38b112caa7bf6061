//! Assembled response and run trace — the terminal, persisted shape of a run.

use crate::artifact::{Artifact, VerificationResult};
use crate::dag::Dag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssemblyMethod {
    Concatenate,
    BestSingle,
    Synthesize,
    Consensus,
}

impl std::fmt::Display for AssemblyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssemblyMethod::Concatenate => "concatenate",
            AssemblyMethod::BestSingle => "best-single",
            AssemblyMethod::Synthesize => "synthesize",
            AssemblyMethod::Consensus => "consensus",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledResponse {
    pub output: String,
    pub source_artifact_ids: Vec<String>,
    pub confidence: f64,
    pub method: AssemblyMethod,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AssembledResponse {
    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            output: summary.into(),
            source_artifact_ids: Vec::new(),
            confidence: 0.0,
            method: AssemblyMethod::Concatenate,
            metadata: HashMap::new(),
        }
    }
}

/// Per-call cost/latency/success record, used by the telemetry collector and
/// embedded in the run trace for the `total_cost` / `total_latency` totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub task_id: String,
    pub provider_id: String,
    pub success: bool,
    pub latency_ms: u64,
    pub cost: f64,
    pub tokens: u32,
    pub timestamp: DateTime<Utc>,
}

/// Router decision record, kept alongside call records for the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub task_id: String,
    pub provider_id: String,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// The full record of one run, persisted by the journal at terminal states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrace {
    pub run_id: String,
    pub input: String,
    pub dag: Dag,
    pub artifacts: Vec<Artifact>,
    pub verifications: Vec<VerificationResult>,
    pub response: Option<AssembledResponse>,
    pub total_cost: f64,
    pub total_latency_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl RunTrace {
    pub fn new(run_id: impl Into<String>, input: impl Into<String>, dag: Dag) -> Self {
        Self {
            run_id: run_id.into(),
            input: input.into(),
            dag,
            artifacts: Vec::new(),
            verifications: Vec::new(),
            response: None,
            total_cost: 0.0,
            total_latency_ms: 0,
            started_at: Utc::now(),
        }
    }

    pub fn record_artifact(&mut self, artifact: Artifact) {
        self.total_cost += artifact.cost;
        self.total_latency_ms += artifact.latency_ms;
        if let Some(v) = artifact.verification.clone() {
            self.verifications.push(v);
        }
        self.artifacts.push(artifact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::TokenUsage;
    use crate::task::{Task, TaskKind};

    #[test]
    fn run_trace_round_trips_through_json() {
        let dag = Dag::new(vec![Task::new("t1", "do a thing", TaskKind::Generate)], vec![]);
        let mut trace = RunTrace::new("run_1", "do the thing", dag);
        trace.record_artifact(Artifact {
            task_id: "t1".to_string(),
            provider_id: "m1".to_string(),
            prompt: "do a thing".to_string(),
            response: "done".to_string(),
            tokens: TokenUsage { input_tokens: 5, output_tokens: 5 },
            latency_ms: 100,
            timestamp: Utc::now(),
            success: true,
            error: None,
            verification: None,
            repair_count: 0,
            fallback_of: None,
            cost: 0.01,
            cancelled_before_start: false,
        });

        let json = serde_json::to_string(&trace).unwrap();
        let reloaded: RunTrace = serde_json::from_str(&json).unwrap();

        assert_eq!(reloaded.run_id, trace.run_id);
        assert_eq!(reloaded.dag.tasks.len(), trace.dag.tasks.len());
        assert_eq!(reloaded.artifacts.len(), trace.artifacts.len());
        assert_eq!(reloaded.artifacts[0].task_id, "t1");
        assert!((reloaded.total_cost - trace.total_cost).abs() < 1e-9);
    }
}
