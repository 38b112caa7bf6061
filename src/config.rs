//! Engine configuration: a TOML file layered under environment variables
//! prefixed `AI3_`, built with
//! `Config::builder()...add_source(File)...add_source(Environment::with_prefix(...))`.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_planner_model")]
    pub model: String,
    #[serde(default = "default_planner_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_planner_temperature")]
    pub temperature: f32,
}

fn default_planner_model() -> String {
    "heuristic".to_string()
}

fn default_planner_max_tokens() -> u32 {
    2048
}

fn default_planner_temperature() -> f32 {
    0.2
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model: default_planner_model(),
            max_tokens: default_planner_max_tokens(),
            temperature: default_planner_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_concurrency_per_provider")]
    pub max_concurrency_per_provider: usize,
    #[serde(default = "default_repair_limit")]
    pub repair_limit: u32,
    #[serde(default = "default_verify")]
    pub verify: bool,
    #[serde(default = "default_capabilities_path")]
    pub capabilities_path: String,
    #[serde(default = "default_telemetry_path")]
    pub telemetry_path: String,
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,
    #[serde(default)]
    pub planner: PlannerConfig,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_max_concurrency_per_provider() -> usize {
    3
}

fn default_repair_limit() -> u32 {
    1
}

fn default_verify() -> bool {
    true
}

fn default_capabilities_path() -> String {
    "configs/capabilities.json".to_string()
}

fn default_telemetry_path() -> String {
    ".ai3_telemetry.json".to_string()
}

fn default_journal_dir() -> String {
    ".ai3_journal".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_concurrency_per_provider: default_max_concurrency_per_provider(),
            repair_limit: default_repair_limit(),
            verify: default_verify(),
            capabilities_path: default_capabilities_path(),
            telemetry_path: default_telemetry_path(),
            journal_dir: default_journal_dir(),
            planner: PlannerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads defaults, layers an optional TOML file over them (missing file
    /// is not an error — the defaults stand alone), then layers `AI3_`
    /// prefixed environment variables over both. Nested fields are reached
    /// with a double underscore, e.g. `AI3_PLANNER__MODEL`.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let builder = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("AI3").separator("__"));

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }
}
