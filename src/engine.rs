//! Top-level engine: wires the planner, capability registry, router,
//! concurrency limiter, scheduler/controller, verifier, telemetry
//! collector, assembler, and journal into the two call surfaces a caller
//! actually uses.
//!
//! The `run`/`run_streaming` split, both draining the same internal event
//! stream the scheduler produces, scopes a familiar service-wiring pattern
//! down from process-lifetime to one run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use orch_assembler::{Assembler, AssemblyStrategy};
use orch_registry::{CapabilityRegistry, RegistryError};
use orch_router::{Router, RouterConfig, RouterError};
use orch_scheduler::{execute as run_schedule, ConcurrencyLimiter, SchedulerError, TaskExecutor};
use orch_telemetry::{TelemetryCollector, TelemetryError};
use orch_types::dag::DagStructureError;
use orch_types::events::{event_channel, EngineEvent, EventSender, PlanStatus, RunStats};
use orch_types::planner::{PlanError, Planner};
use orch_types::response::AssembledResponse;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::journal::Journal;
use crate::provider::ProviderFactory;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("capability registry failed to load: {0}")]
    Registry(#[from] RegistryError),
    #[error("telemetry failed to load: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("router configuration is invalid: {0}")]
    Router(#[from] RouterError),
    #[error("planner produced an invalid plan: {0}")]
    Plan(#[from] PlanError),
    #[error("plan failed structural validation: {0}")]
    InvalidDag(#[from] DagStructureError),
    #[error("scheduler failed: {0}")]
    Scheduler(#[from] SchedulerError),
}

pub type EngineResult<T> = Result<T, EngineError>;

pub struct Engine {
    config: EngineConfig,
    registry: CapabilityRegistry,
    telemetry: TelemetryCollector,
    router: Router,
    providers: ProviderFactory,
    planner: Arc<dyn Planner>,
    assembler: Assembler,
}

impl Engine {
    /// Loads the capabilities configuration and any persisted telemetry
    /// aggregates at startup.
    pub fn new(config: EngineConfig, planner: Arc<dyn Planner>) -> EngineResult<Self> {
        let registry = CapabilityRegistry::load_from_path(&config.capabilities_path)?;
        let telemetry = TelemetryCollector::load_from_path(&config.telemetry_path)?;
        let router = Router::new(RouterConfig::default())?;

        let cost_per_1k: HashMap<String, f64> = registry
            .list_all()
            .into_iter()
            .filter_map(|id| registry.lookup(&id).map(|record| (id, record.cost_per_1k_tokens)))
            .collect();
        let providers = ProviderFactory::new(cost_per_1k);

        Ok(Self {
            config,
            registry,
            telemetry,
            router,
            providers,
            planner,
            assembler: Assembler::new(AssemblyStrategy::Synthesize),
        })
    }

    /// Blocking run-to-completion: internally drains the same event stream
    /// `run_streaming` exposes but discards intermediate events, returning
    /// only the final response.
    pub async fn run(&self, input: &str, cancel: Option<CancellationToken>) -> EngineResult<AssembledResponse> {
        let cancel = cancel.unwrap_or_default();
        let (tx, mut rx) = event_channel(EVENT_CHANNEL_CAPACITY);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let result = self.execute_run(input, &cancel, tx).await;
        let _ = drain.await;

        let (response, _stats, _run_id) = result?;
        Ok(response)
    }

    /// Streaming surface: every event the scheduler/controller and
    /// assembler produce is forwarded to the caller in emission order
    /// over a bounded channel — backpressure on a slow consumer propagates
    /// back to the scheduler's dispatch loop, since `execute_run` blocks on
    /// `events.send` the same way whether or not anyone is draining `rx`
    /// through this stream.
    pub fn run_streaming<'a>(&'a self, input: String, cancel: Option<CancellationToken>) -> impl futures::Stream<Item = EngineEvent> + 'a {
        let cancel = cancel.unwrap_or_default();
        async_stream::stream! {
            let (tx, mut rx) = event_channel(EVENT_CHANNEL_CAPACITY);
            let run_future = self.execute_run(&input, &cancel, tx);
            tokio::pin!(run_future);
            let mut finished = false;

            // The `run_future` arm is gated on `!finished` because a resolved
            // future must never be polled again. The `recv` arm is left
            // ungated: once `run_future` completes its sender is dropped, and
            // we still need to keep draining any buffered events up to the
            // `None` that signals the channel is empty and closed. Gating
            // both arms on the same flag would leave every branch disabled
            // the moment `run_future` resolves, which `select!` treats as a
            // bug and panics on.
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => {
                        match event {
                            Some(event) => yield event,
                            None => break,
                        }
                    }
                    result = &mut run_future, if !finished => {
                        finished = true;
                        if let Err(err) = result {
                            yield EngineEvent::Error { message: err.to_string() };
                        }
                    }
                }
            }
        }
    }

    /// Shared execution path: plans, schedules, assembles, and journals one
    /// run. Events produced by `run_body` are recorded to the journal's
    /// trace in the exact order they're emitted, then forwarded onto
    /// `external_events` — so `trace.jsonl` is a faithful, ordered record of
    /// what a streaming caller would have observed, not a reconstruction.
    async fn execute_run(&self, input: &str, cancel: &CancellationToken, external_events: EventSender) -> EngineResult<(AssembledResponse, RunStats, String)> {
        let run_id = new_run_id();
        let journal = match Journal::open(&self.config.journal_dir, &run_id) {
            Ok(journal) => Some(journal),
            Err(err) => {
                error!(error = %err, "failed to open journal, degrading to best-effort persistence");
                None
            }
        };
        if let Some(journal) = &journal {
            let _ = journal.write_input(input);
        }

        let (tx, mut rx) = event_channel(EVENT_CHANNEL_CAPACITY);
        let run_future = self.run_body(input, cancel, tx, journal.as_ref());
        tokio::pin!(run_future);
        let mut finished = false;
        let mut outcome = None;

        // Same ungated-recv / gated-future shape as `run_streaming`, so that
        // every event the body produces is journaled and forwarded before
        // this function returns, and the final `None` only arrives once the
        // body's sender has dropped and the queue is fully drained.
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(journal) = &journal {
                                let _ = journal.record_event(&event);
                            }
                            let _ = external_events.send(event).await;
                        }
                        None => break,
                    }
                }
                result = &mut run_future, if !finished => {
                    finished = true;
                    outcome = Some(result);
                }
            }
        }

        let (response, stats) = outcome.expect("run body resolves before its event sender is fully drained")?;

        if let Some(journal) = &journal {
            let _ = journal.write_output(&response.output);
            let _ = journal.write_stats(&stats);
            let _ = journal.append_to_index(&self.config.journal_dir, input, stats.task_count, &stats);
        }

        if let Err(err) = self.telemetry.persist_to_path(&self.config.telemetry_path) {
            error!(error = %err, "failed to persist telemetry aggregates");
        }

        info!(run_id = %run_id, task_count = stats.task_count, completed = stats.completed, "run finished");
        Ok((response, stats, run_id))
    }

    /// Plans, schedules, and assembles one run, sending every lifecycle
    /// event onto `events` as it happens. Split out from `execute_run` so
    /// the journal-recording/forwarding loop can sit between this and
    /// whichever caller (blocking or streaming) ultimately consumes events.
    async fn run_body(
        &self,
        input: &str,
        cancel: &CancellationToken,
        events: EventSender,
        journal: Option<&Journal>,
    ) -> EngineResult<(AssembledResponse, RunStats)> {
        let _ = events.send(EngineEvent::Plan { status: PlanStatus::Started, task_count: None }).await;
        let dag = self.planner.plan(input).await?;
        dag.validate_structure()?;
        let _ = events.send(EngineEvent::Plan { status: PlanStatus::Completed, task_count: Some(dag.tasks.len()) }).await;
        if let Some(journal) = journal {
            let _ = journal.write_plan(&dag);
        }

        let limiter = ConcurrencyLimiter::new(self.config.max_concurrency, self.config.max_concurrency_per_provider);
        let verifier = orch_verifier::Verifier::new();
        let repair_limit = if self.config.verify { self.config.repair_limit } else { 0 };
        let executor = TaskExecutor {
            router: &self.router,
            registry: &self.registry,
            verifier: &verifier,
            providers: &self.providers,
            limiter: &limiter,
            telemetry: &self.telemetry,
            repair_limit,
            call_timeout: std::time::Duration::from_secs(60),
        };

        let outcome = run_schedule(&dag, &executor, &events, cancel).await?;

        let method = self.assembler_method_name();
        let _ = events.send(EngineEvent::AssembleStart { method: method.clone() }).await;
        let artifacts: Vec<_> = outcome.artifacts.values().cloned().collect();
        let response = self.assembler.assemble(&dag.tasks, &artifacts);
        let _ = events.send(EngineEvent::Final { output: response.output.clone() }).await;

        let stats = RunStats {
            total_cost: self.telemetry.total_cost(),
            total_latency_ms: self.telemetry.total_latency_ms(),
            task_count: dag.tasks.len(),
            completed: outcome.completed_count(),
            failed: outcome.failed_count(),
            skipped: outcome.skipped_count(),
        };
        let _ = events.send(EngineEvent::Stats { stats: stats.clone() }).await;

        Ok((response, stats))
    }

    fn assembler_method_name(&self) -> String {
        "synthesize".to_string()
    }
}

fn new_run_id() -> String {
    let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
    millis.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::MockPlanner;
    use futures::StreamExt;
    use std::io::Write;

    fn capabilities_fixture() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "telemetry_window_hours": 24,
                "models": {{
                    "m1": {{
                        "provider": "anthropic",
                        "skills": {{"generate": 0.9}},
                        "context_window": 100000,
                        "cost_per_1k_tokens": 0.003,
                        "avg_latency_ms": 500,
                        "error_rate": 0.0,
                        "supports_streaming": true,
                        "supports_vision": false,
                        "supports_function_calling": true,
                        "max_output_tokens": 4096
                    }}
                }}
            }}"#
        )
        .unwrap();
        file
    }

    fn test_engine() -> (Engine, tempfile::NamedTempFile, tempfile::TempDir) {
        let capabilities = capabilities_fixture();
        let journal_dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.capabilities_path = capabilities.path().display().to_string();
        config.telemetry_path = journal_dir.path().join("telemetry.json").display().to_string();
        config.journal_dir = journal_dir.path().join("journal").display().to_string();
        let engine = Engine::new(config, Arc::new(MockPlanner)).unwrap();
        (engine, capabilities, journal_dir)
    }

    #[tokio::test]
    async fn run_produces_a_non_empty_response() {
        let (engine, _capabilities, _journal_dir) = test_engine();
        let response = engine.run("Write a short poem about rivers", None).await.unwrap();
        assert!(!response.output.is_empty());
        assert!(response.confidence > 0.0);
    }

    #[tokio::test]
    async fn run_streaming_emits_plan_then_final() {
        let (engine, _capabilities, _journal_dir) = test_engine();
        let events: Vec<EngineEvent> = engine.run_streaming("Write a haiku".to_string(), None).collect().await;

        assert!(matches!(events.first(), Some(EngineEvent::Plan { status: PlanStatus::Started, .. })));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Final { .. })));
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Stats { .. })));
    }

    #[tokio::test]
    async fn run_writes_a_journal_directory() {
        let (engine, _capabilities, journal_dir) = test_engine();
        engine.run("Summarize this text", None).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(journal_dir.path().join("journal")).unwrap().collect();
        assert!(!entries.is_empty());
    }

    #[tokio::test]
    async fn journal_trace_records_the_live_event_order() {
        let (engine, _capabilities, journal_dir) = test_engine();
        engine.run("Summarize this text", None).await.unwrap();

        let run_dir = std::fs::read_dir(journal_dir.path().join("journal"))
            .unwrap()
            .find_map(|entry| {
                let entry = entry.unwrap();
                entry.file_name().to_string_lossy().starts_with("run_").then(|| entry.path())
            })
            .expect("a run_<id> directory");
        let run_id = run_dir.file_name().unwrap().to_string_lossy().trim_start_matches("run_").to_string();
        let journal = Journal::open(journal_dir.path().join("journal"), run_id).unwrap();
        let trace = journal.read_trace().unwrap();

        // The plan event must precede every task-lifecycle event, and the
        // trace must carry task-level events straight from the scheduler
        // rather than only a post-hoc task_artifact reconstruction.
        let plan_idx = trace.iter().position(|e| matches!(e, EngineEvent::Plan { status: PlanStatus::Started, .. })).unwrap();
        let task_start_idx = trace.iter().position(|e| matches!(e, EngineEvent::TaskStart { .. })).unwrap();
        assert!(plan_idx < task_start_idx);
        assert!(trace.iter().any(|e| matches!(e, EngineEvent::TaskArtifact { .. })));
        assert!(trace.iter().any(|e| matches!(e, EngineEvent::Final { .. })));
    }
}
