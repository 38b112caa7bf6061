//! Engine event stream (spec §6): the external interface a caller consumes
//! either all at once (`run`, only the `final`/`error` events matter) or
//! incrementally (`run_streaming`).
//!
//! The event type is kept in the shared crate, rather than in the top-level
//! binary/library, because both `orch-scheduler` (task lifecycle events) and
//! the top-level assembler/journal wiring (`assemble_start`, `final`,
//! `stats`) need to construct and forward the same values without a
//! dependency cycle back through the root crate.

use crate::artifact::{Artifact, VerificationResult};
use serde::{Deserialize, Serialize};

/// Bounded sender every run-producing component is handed. Bounded so that a
/// slow consumer applies natural backpressure to the scheduler rather than
/// letting the event log grow without limit.
pub type EventSender = tokio::sync::mpsc::Sender<EngineEvent>;
pub type EventReceiver = tokio::sync::mpsc::Receiver<EngineEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::channel(capacity)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Started,
    Completed,
}

/// A slimmed-down view of an `Artifact`, small enough to carry on every
/// `task_artifact` event without duplicating the full prompt/response text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub provider_id: String,
    pub success: bool,
    pub latency_ms: u64,
    pub output_tokens: u32,
    pub cost: f64,
}

impl From<&Artifact> for ArtifactSummary {
    fn from(artifact: &Artifact) -> Self {
        Self {
            provider_id: artifact.provider_id.clone(),
            success: artifact.success,
            latency_ms: artifact.latency_ms,
            output_tokens: artifact.tokens.output_tokens,
            cost: artifact.cost,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub passed: bool,
    pub score: f64,
    pub needs_repair: bool,
}

impl From<&VerificationResult> for VerificationSummary {
    fn from(result: &VerificationResult) -> Self {
        Self {
            passed: result.passed,
            score: result.score,
            needs_repair: result.needs_repair,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub total_cost: f64,
    pub total_latency_ms: u64,
    pub task_count: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// One event on the run's event stream, emitted in the order named in spec
/// §6's event table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    Plan {
        status: PlanStatus,
        task_count: Option<usize>,
    },
    TaskStart {
        task_id: String,
        description: String,
    },
    Decision {
        task_id: String,
        provider_id: String,
        score: f64,
    },
    TaskArtifact {
        task_id: String,
        artifact: ArtifactSummary,
    },
    TaskVerified {
        task_id: String,
        verification: VerificationSummary,
    },
    TaskRepaired {
        task_id: String,
        attempt: u32,
    },
    TaskFallback {
        task_id: String,
        excluded_provider: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskSkipped {
        task_id: String,
        reason: String,
    },
    AssembleStart {
        method: String,
    },
    Final {
        output: String,
    },
    Stats {
        stats: RunStats,
    },
    Error {
        message: String,
    },
}
