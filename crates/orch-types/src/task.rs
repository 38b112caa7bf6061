//! Task and DAG data structures.
//!
//! A `Task` is a unit of work produced by the (external) planner. Tasks are
//! assembled into a `Dag` together with `Edge`s describing dependency order.
//! Mirrors the `Task`/`Priority` shape of `chimera-layer4::types`, generalized
//! from a single WASM-agent dispatch record to a planner-produced subtask.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a task within one DAG. Planner-assigned, not a UUID,
/// since plans reference task IDs by name in dependency lists.
pub type TaskId = String;

/// Closed set of task kinds, extensible by configuration (new kinds are
/// accepted by the type system as a `String` inside `requirements.capability`
/// but routing defaults apply only to the five named here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Generate,
    Reason,
    Transform,
    Summarize,
    Synthesize,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Generate => "generate",
            TaskKind::Reason => "reason",
            TaskKind::Transform => "transform",
            TaskKind::Summarize => "summarize",
            TaskKind::Synthesize => "synthesize",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Relative scheduling priority. Higher values are not preferential within a
/// single wavefront (the scheduler dispatches a whole wavefront at once) but
/// are available for limiter admission ordering and for assemblers/UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Background = 1,
    Low = 25,
    Normal = 50,
    High = 75,
    Critical = 100,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// What a task requires from the router: a capability label used for skill
/// lookup and a minimum acceptable verification score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirements {
    pub capability: String,
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
    #[serde(default)]
    pub required_features: Vec<String>,
    #[serde(default)]
    pub context_tokens: Option<u32>,
}

fn default_min_quality() -> f64 {
    0.7
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            capability: String::new(),
            min_quality: default_min_quality(),
            required_features: Vec::new(),
            context_tokens: None,
        }
    }
}

/// Lifecycle state of a task as seen by the scheduler/controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// A unit of work decomposed by the (external) planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub quality_criteria: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Filled in at schedule time once the router has made a decision.
    #[serde(default)]
    pub assigned_provider: Option<String>,
    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind,
            requirements: Requirements::default(),
            quality_criteria: Vec::new(),
            priority: Priority::default(),
            assigned_provider: None,
            status: TaskStatus::Pending,
            metadata: HashMap::new(),
        }
    }
}

/// Join semantics for an edge's downstream task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Downstream task dispatches only once every parent is terminal-success.
    All,
    /// Downstream task dispatches as soon as any one parent succeeds.
    Any,
}

impl Default for JoinKind {
    fn default() -> Self {
        JoinKind::All
    }
}

/// A directed dependency `from -> to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: TaskId,
    pub to: TaskId,
    #[serde(default)]
    pub join: JoinKind,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            join: JoinKind::All,
        }
    }

    pub fn any(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            join: JoinKind::Any,
        }
    }
}
