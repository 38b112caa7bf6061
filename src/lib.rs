//! AI task orchestrator core: decomposes a free-form request into a DAG of
//! typed subtasks, routes each to a capability-scored provider, executes
//! with bounded concurrency, verifies and repairs/falls back on failure,
//! assembles the results, and journals the full run.
//!
//! This crate wires together the `orch-*` workspace members (types,
//! registry, router, verifier, scheduler, telemetry, assembler) plus the
//! ambient concerns that only make sense at the top of the workspace:
//! configuration, provider adapters, the planner port, the run journal, and
//! the engine that ties it all together.

pub mod config;
pub mod engine;
pub mod journal;
pub mod planner;
pub mod provider;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError, EngineResult};
pub use journal::{Journal, JournalError};
pub use planner::MockPlanner;
pub use provider::{MockProviderAdapter, ProviderFactory};

pub use orch_types::artifact::{Artifact, TokenUsage, VerificationResult};
pub use orch_types::dag::Dag;
pub use orch_types::events::EngineEvent;
pub use orch_types::planner::Planner;
pub use orch_types::provider::ProviderAdapter;
pub use orch_types::response::AssembledResponse;
pub use orch_types::task::{Task, TaskKind};
