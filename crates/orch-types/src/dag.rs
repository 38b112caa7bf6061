//! The DAG container and its structural (non-cycle) invariants.
//!
//! Cycle detection is a scheduling concern (it falls out of Kahn's algorithm
//! used for wavefront extraction) and lives in `orch-scheduler`. This module
//! only guarantees the cheap, purely data-level invariants from the task
//! model: unique IDs, edges referencing known tasks, and at least one root.

use crate::task::{Edge, Task, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagStructureError {
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(TaskId),
    #[error("edge references unknown task: {0}")]
    UnknownEdgeEndpoint(TaskId),
    #[error("dag has no root task (every task has an incoming edge)")]
    NoRoots,
    #[error("dag has no tasks")]
    Empty,
}

impl Dag {
    pub fn new(tasks: Vec<Task>, edges: Vec<Edge>) -> Self {
        Self { tasks, edges }
    }

    pub fn task_ids(&self) -> HashSet<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn task_by_id(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Outgoing adjacency: task id -> (successor id, join kind).
    pub fn adjacency(&self) -> HashMap<&str, Vec<(&str, &Edge)>> {
        let mut adj: HashMap<&str, Vec<(&str, &Edge)>> =
            self.tasks.iter().map(|t| (t.id.as_str(), Vec::new())).collect();
        for edge in &self.edges {
            adj.entry(edge.from.as_str())
                .or_default()
                .push((edge.to.as_str(), edge));
        }
        adj
    }

    /// In-degree per task id, counting one unit per incoming edge regardless
    /// of join kind (the scheduler interprets `any` joins specially when
    /// deciding readiness, but in-degree bookkeeping is uniform).
    pub fn in_degrees(&self) -> HashMap<&str, usize> {
        let mut deg: HashMap<&str, usize> =
            self.tasks.iter().map(|t| (t.id.as_str(), 0)).collect();
        for edge in &self.edges {
            if let Some(d) = deg.get_mut(edge.to.as_str()) {
                *d += 1;
            }
        }
        deg
    }

    /// Validates the structural (non-cycle) invariants from §3 of the spec.
    pub fn validate_structure(&self) -> Result<(), DagStructureError> {
        if self.tasks.is_empty() {
            return Err(DagStructureError::Empty);
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(DagStructureError::DuplicateTaskId(task.id.clone()));
            }
        }

        let ids = self.task_ids();
        for edge in &self.edges {
            if !ids.contains(edge.from.as_str()) {
                return Err(DagStructureError::UnknownEdgeEndpoint(edge.from.clone()));
            }
            if !ids.contains(edge.to.as_str()) {
                return Err(DagStructureError::UnknownEdgeEndpoint(edge.to.clone()));
            }
        }

        let in_degrees = self.in_degrees();
        if !in_degrees.values().any(|&d| d == 0) {
            return Err(DagStructureError::NoRoots);
        }

        Ok(())
    }
}
