//! Planner port: `plan(user_text) -> DAG`, treated as a pure function and
//! specified only by interface. A `MockPlanner` implementation ships at the
//! top of the workspace for tests and the CLI's default mode.

use crate::dag::Dag;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum PlanError {
    #[error("planner returned invalid JSON: {0}")]
    InvalidJson(String),
    #[error("planner output did not match the DAG schema: {0}")]
    SchemaMismatch(String),
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, user_text: &str) -> Result<Dag, PlanError>;
}
