//! DAG scheduler (spec §4.3): validates structure and acyclicity, then
//! dispatches tasks as their join conditions are satisfied, running
//! independent tasks concurrently and propagating upstream failure as a
//! `skipped` status down any affected subtree.
//!
//! Generalized from `chimera-layer4::scheduler`'s single priority queue of
//! independent agent dispatches to Kahn's-algorithm wavefronts over a task
//! DAG with `all`/`any` join semantics.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

use futures::future::Future;
use futures::stream::{FuturesUnordered, StreamExt};
use orch_types::dag::{Dag, DagStructureError};
use orch_types::events::{EngineEvent, EventSender};
use orch_types::task::{Edge, JoinKind, Task, TaskId, TaskStatus};
use orch_types::artifact::Artifact;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::executor::TaskExecutor;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid dag: {0}")]
    InvalidDag(#[from] DagStructureError),
    #[error("dag contains a cycle")]
    Cycle,
}

pub struct SchedulerOutcome {
    pub artifacts: HashMap<TaskId, Artifact>,
    pub statuses: HashMap<TaskId, TaskStatus>,
    pub completion_order: Vec<TaskId>,
}

impl SchedulerOutcome {
    pub fn completed_count(&self) -> usize {
        self.statuses.values().filter(|s| **s == TaskStatus::Completed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.statuses.values().filter(|s| **s == TaskStatus::Failed).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.statuses.values().filter(|s| **s == TaskStatus::Skipped).count()
    }
}

/// Per-task bookkeeping for join readiness. `required_*` tracks `all`-join
/// incoming edges; `any_*` tracks `any`-join ones. A task with a mix of both
/// is ready once every required parent has succeeded and, if any `any`
/// edges exist, at least one of those has also succeeded.
struct Gate {
    required_remaining: usize,
    required_failed: bool,
    any_total: usize,
    any_remaining: usize,
    any_satisfied: bool,
    /// Set the moment the task is pushed onto the ready or skip queue, so a
    /// second predecessor resolving in the same tick cannot enqueue it twice.
    queued: bool,
}

impl Gate {
    fn is_ready(&self) -> bool {
        !self.queued
            && self.required_remaining == 0
            && !self.required_failed
            && (self.any_total == 0 || self.any_satisfied)
    }

    fn is_doomed(&self) -> bool {
        !self.queued
            && (self.required_failed || (self.any_total > 0 && self.any_remaining == 0 && !self.any_satisfied))
    }
}

/// Validates acyclicity via a pure Kahn's-algorithm simulation (no
/// execution): repeatedly removes zero-in-degree nodes and checks that every
/// task is eventually removed.
fn check_acyclic(dag: &Dag) -> Result<(), SchedulerError> {
    let mut in_degree = dag.in_degrees();
    let adjacency = dag.adjacency();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut removed = 0usize;

    while let Some(id) = queue.pop_front() {
        removed += 1;
        if let Some(successors) = adjacency.get(id) {
            for (succ, _edge) in successors {
                if let Some(d) = in_degree.get_mut(succ) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }
    }

    if removed == dag.tasks.len() {
        Ok(())
    } else {
        Err(SchedulerError::Cycle)
    }
}

fn build_gates(dag: &Dag) -> HashMap<TaskId, Gate> {
    let mut gates: HashMap<TaskId, Gate> = dag
        .tasks
        .iter()
        .map(|t| {
            (
                t.id.clone(),
                Gate {
                    required_remaining: 0,
                    required_failed: false,
                    any_total: 0,
                    any_remaining: 0,
                    any_satisfied: false,
                    queued: false,
                },
            )
        })
        .collect();

    for edge in &dag.edges {
        let gate = gates.get_mut(&edge.to).expect("validated structure guarantees known endpoints");
        match edge.join {
            JoinKind::All => gate.required_remaining += 1,
            JoinKind::Any => {
                gate.any_total += 1;
                gate.any_remaining += 1;
            }
        }
    }
    gates
}

fn adjacency_owned(dag: &Dag) -> HashMap<TaskId, Vec<(TaskId, JoinKind)>> {
    let mut adj: HashMap<TaskId, Vec<(TaskId, JoinKind)>> = dag.tasks.iter().map(|t| (t.id.clone(), Vec::new())).collect();
    for Edge { from, to, join } in &dag.edges {
        adj.entry(from.clone()).or_default().push((to.clone(), *join));
    }
    adj
}

pub async fn execute<'a>(
    dag: &'a Dag,
    executor: &'a TaskExecutor<'a>,
    events: &'a EventSender,
    cancel: &'a CancellationToken,
) -> Result<SchedulerOutcome, SchedulerError> {
    dag.validate_structure()?;
    check_acyclic(dag)?;

    let tasks_by_id: HashMap<&str, &Task> = dag.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let adjacency = adjacency_owned(dag);
    let mut gates = build_gates(dag);

    let mut artifacts: HashMap<TaskId, Artifact> = HashMap::new();
    let mut statuses: HashMap<TaskId, TaskStatus> = HashMap::new();
    let mut completion_order: Vec<TaskId> = Vec::new();

    type Pending<'p> = Pin<Box<dyn Future<Output = (TaskId, Artifact)> + 'p>>;
    let mut in_flight: FuturesUnordered<Pending<'a>> = FuturesUnordered::new();

    let mut ready: Vec<TaskId> = gates
        .iter()
        .filter(|(_, g)| g.is_ready())
        .map(|(id, _)| id.clone())
        .collect();
    for id in &ready {
        gates.get_mut(id).unwrap().queued = true;
    }
    let mut skipped_queue: VecDeque<TaskId> = VecDeque::new();

    let total = dag.tasks.len();

    loop {
        ready.sort();
        for task_id in ready.drain(..) {
            // Once cancellation has fired, no new wavefront dispatches:
            // route straight to the skip path instead of spawning a future
            // that would just observe the cancellation and fail immediately.
            if cancel.is_cancelled() {
                skipped_queue.push_back(task_id);
                continue;
            }
            let task = *tasks_by_id.get(task_id.as_str()).expect("task exists");
            let fut: Pending<'a> = Box::pin(async move {
                let artifact = executor.run(task, events, cancel).await;
                (task_id, artifact)
            });
            in_flight.push(fut);
        }

        while let Some(task_id) = skipped_queue.pop_front() {
            if statuses.contains_key(&task_id) {
                continue;
            }
            let reason = if cancel.is_cancelled() {
                "run cancelled before dispatch".to_string()
            } else {
                "upstream task failed or produced no viable path".to_string()
            };
            let _ = events
                .send(EngineEvent::TaskSkipped {
                    task_id: task_id.clone(),
                    reason: reason.clone(),
                })
                .await;
            statuses.insert(task_id.clone(), TaskStatus::Skipped);
            artifacts.insert(task_id.clone(), Artifact::empty_failed(&task_id, "", reason));
            completion_order.push(task_id.clone());

            if let Some(successors) = adjacency.get(&task_id) {
                for (succ_id, join) in successors {
                    let gate = match gates.get_mut(succ_id) {
                        Some(g) => g,
                        None => continue,
                    };
                    match join {
                        JoinKind::All => {
                            gate.required_remaining = gate.required_remaining.saturating_sub(1);
                            gate.required_failed = true;
                        }
                        JoinKind::Any => {
                            gate.any_remaining = gate.any_remaining.saturating_sub(1);
                        }
                    }
                    if gate.is_doomed() {
                        gate.queued = true;
                        skipped_queue.push_back(succ_id.clone());
                    } else if gate.is_ready() {
                        gate.queued = true;
                        ready.push(succ_id.clone());
                    }
                }
            }
        }

        if completion_order.len() == total {
            break;
        }

        if !ready.is_empty() {
            continue;
        }

        let (task_id, artifact) = match in_flight.next().await {
            Some(item) => item,
            None => break,
        };

        // A task cancelled while still queued for a concurrency permit never
        // entered RUNNING_*, so it is reported as `Skipped` rather than
        // `Failed` -- only tasks that were actually running when
        // cancellation fired resolve to `Failed` with cause cancelled.
        let status = if artifact.cancelled_before_start {
            TaskStatus::Skipped
        } else if artifact.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        if status == TaskStatus::Skipped {
            let reason = artifact.error.clone().unwrap_or_else(|| "cancelled before dispatch".to_string());
            let _ = events
                .send(EngineEvent::TaskSkipped {
                    task_id: task_id.clone(),
                    reason,
                })
                .await;
        }

        statuses.insert(task_id.clone(), status);
        completion_order.push(task_id.clone());
        artifacts.insert(task_id.clone(), artifact);

        if let Some(successors) = adjacency.get(&task_id) {
            for (succ_id, join) in successors {
                let gate = match gates.get_mut(succ_id) {
                    Some(g) => g,
                    None => continue,
                };
                match join {
                    JoinKind::All => {
                        gate.required_remaining = gate.required_remaining.saturating_sub(1);
                        if status != TaskStatus::Completed {
                            gate.required_failed = true;
                        }
                    }
                    JoinKind::Any => {
                        gate.any_remaining = gate.any_remaining.saturating_sub(1);
                        if status == TaskStatus::Completed {
                            gate.any_satisfied = true;
                        }
                    }
                }
                if gate.is_doomed() {
                    gate.queued = true;
                    skipped_queue.push_back(succ_id.clone());
                } else if gate.is_ready() {
                    gate.queued = true;
                    ready.push(succ_id.clone());
                }
            }
        }
    }

    Ok(SchedulerOutcome {
        artifacts,
        statuses,
        completion_order,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::limiter::ConcurrencyLimiter;
    use orch_registry::CapabilityRegistry;
    use orch_router::{Router, RouterConfig};
    use orch_telemetry::TelemetryCollector;
    use orch_types::capability::CapabilityRecord;
    use orch_types::provider::{GenerateRequest, GenerateResponse, ProviderAdapter, ProviderError};
    use orch_types::task::TaskKind;
    use orch_verifier::Verifier;
    use std::collections::HashMap as Map;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct AdapterByTask {
        fail_tasks: Mutex<std::collections::HashSet<String>>,
    }

    #[async_trait]
    impl ProviderAdapter for AdapterByTask {
        async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
            if self.fail_tasks.lock().unwrap().iter().any(|marker| request.prompt.contains(marker)) {
                return Err(ProviderError::RequestFailed {
                    provider: "m1".to_string(),
                    message: "scripted failure".to_string(),
                });
            }
            Ok(GenerateResponse {
                content: "The task completed successfully and is fully implemented and verified here.".to_string(),
                input_tokens: 10,
                output_tokens: 20,
                cost: 0.001,
                model_id: "m1".to_string(),
                finish_reason: "stop".to_string(),
            })
        }
    }

    struct SingleProviderLookup(Arc<dyn ProviderAdapter>);

    impl crate::executor::ProviderLookup for SingleProviderLookup {
        fn get(&self, _provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
            Some(self.0.clone())
        }
    }

    fn capability() -> CapabilityRecord {
        CapabilityRecord {
            provider: "m1".into(),
            skills: Map::new(),
            context_window: 100_000,
            cost_per_1k_tokens: 0.003,
            avg_latency_ms: 500.0,
            error_rate: 0.0,
            supports_streaming: false,
            supports_vision: false,
            supports_function_calling: false,
            max_output_tokens: 4096,
        }
    }

    fn task(id: &str) -> Task {
        Task::new(id, format!("do work for {id}"), TaskKind::Generate)
    }

    async fn run_dag(dag: &Dag, fail_tasks: &[&str]) -> SchedulerOutcome {
        let registry = CapabilityRegistry::from_records(Map::from([("m1".to_string(), capability())]));
        let router = Router::new(RouterConfig::default()).unwrap();
        let verifier = Verifier::new();
        let limiter = ConcurrencyLimiter::new(8, 8);
        let telemetry = TelemetryCollector::new();
        let adapter = Arc::new(AdapterByTask {
            fail_tasks: Mutex::new(fail_tasks.iter().map(|s| s.to_string()).collect()),
        }) as Arc<dyn ProviderAdapter>;
        let lookup = SingleProviderLookup(adapter);

        let executor = TaskExecutor {
            router: &router,
            registry: &registry,
            verifier: &verifier,
            providers: &lookup,
            limiter: &limiter,
            telemetry: &telemetry,
            repair_limit: 0,
            call_timeout: std::time::Duration::from_secs(5),
        };

        let (tx, mut rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let outcome_fut = execute(dag, &executor, &tx, &cancel);
        tokio::pin!(outcome_fut);
        loop {
            tokio::select! {
                outcome = &mut outcome_fut => {
                    drop(tx);
                    while rx.recv().await.is_some() {}
                    return outcome.unwrap();
                }
                _ = rx.recv() => {}
            }
        }
    }

    #[tokio::test]
    async fn linear_chain_runs_in_order() {
        let dag = Dag::new(
            vec![task("a"), task("b"), task("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
        );
        let outcome = run_dag(&dag, &[]).await;
        assert_eq!(outcome.completed_count(), 3);
        assert_eq!(outcome.completion_order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn diamond_joins_only_after_both_parents_succeed() {
        let dag = Dag::new(
            vec![task("a"), task("b"), task("c"), task("d")],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        );
        let outcome = run_dag(&dag, &[]).await;
        assert_eq!(outcome.completed_count(), 4);
        let d_pos = outcome.completion_order.iter().position(|id| id == "d").unwrap();
        let b_pos = outcome.completion_order.iter().position(|id| id == "b").unwrap();
        let c_pos = outcome.completion_order.iter().position(|id| id == "c").unwrap();
        assert!(d_pos > b_pos && d_pos > c_pos);
    }

    #[tokio::test]
    async fn any_join_dispatches_once_first_parent_succeeds() {
        let dag = Dag::new(
            vec![task("a"), task("b"), task("c")],
            vec![Edge::any("a", "c"), Edge::any("b", "c")],
        );
        let outcome = run_dag(&dag, &["b"]).await;
        assert_eq!(outcome.statuses["a"], TaskStatus::Completed);
        assert_eq!(outcome.statuses["b"], TaskStatus::Failed);
        assert_eq!(outcome.statuses["c"], TaskStatus::Completed);
    }

    #[tokio::test]
    async fn failed_required_parent_skips_descendants() {
        let dag = Dag::new(
            vec![task("a"), task("b"), task("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
        );
        let outcome = run_dag(&dag, &["a"]).await;
        assert_eq!(outcome.statuses["a"], TaskStatus::Failed);
        assert_eq!(outcome.statuses["b"], TaskStatus::Skipped);
        assert_eq!(outcome.statuses["c"], TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_dispatch() {
        // `a` and `d` are roots so structural validation passes; `b`/`c`
        // form a cycle the acyclicity check must still catch.
        let dag = Dag::new(
            vec![task("a"), task("b"), task("c"), task("d")],
            vec![Edge::new("a", "b"), Edge::new("b", "c"), Edge::new("c", "b")],
        );
        let registry = CapabilityRegistry::from_records(Map::from([("m1".to_string(), capability())]));
        let router = Router::new(RouterConfig::default()).unwrap();
        let verifier = Verifier::new();
        let limiter = ConcurrencyLimiter::new(4, 4);
        let telemetry = TelemetryCollector::new();
        let adapter = Arc::new(AdapterByTask {
            fail_tasks: Mutex::new(std::collections::HashSet::new()),
        }) as Arc<dyn ProviderAdapter>;
        let lookup = SingleProviderLookup(adapter);
        let executor = TaskExecutor {
            router: &router,
            registry: &registry,
            verifier: &verifier,
            providers: &lookup,
            limiter: &limiter,
            telemetry: &telemetry,
            repair_limit: 0,
            call_timeout: std::time::Duration::from_secs(5),
        };
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let result = execute(&dag, &executor, &tx, &cancel).await;
        assert!(matches!(result, Err(SchedulerError::Cycle)));
    }
}
