//! Telemetry collector: the current run's in-memory call/decision log plus
//! cross-run historical aggregates persisted to JSON at finalization and
//! reloaded at the next engine startup.
//!
//! In-memory during a run and flushed once at the end rather than
//! per-event, since these aggregates feed router decisions rather than a
//! compliance trail.

use chrono::Utc;
use orch_types::response::{CallRecord, DecisionRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to read telemetry file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write telemetry file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid telemetry JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Conservative default used when a provider has no historical calls yet.
pub const DEFAULT_SUCCESS_RATE: f64 = 0.8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderAggregate {
    pub total_calls: u64,
    pub successes: u64,
    pub cumulative_latency_ms: u64,
    pub cumulative_cost: f64,
    pub cumulative_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalAggregates {
    pub providers: HashMap<String, ProviderAggregate>,
}

/// Derived read-only view the router consumes.
#[derive(Debug, Clone, Copy)]
pub struct ProviderStats {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub avg_cost: f64,
    pub has_history: bool,
}

pub struct TelemetryCollector {
    current_calls: RwLock<Vec<CallRecord>>,
    current_decisions: RwLock<Vec<DecisionRecord>>,
    historical: RwLock<HistoricalAggregates>,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self {
            current_calls: RwLock::new(Vec::new()),
            current_decisions: RwLock::new(Vec::new()),
            historical: RwLock::new(HistoricalAggregates::default()),
        }
    }

    /// Loads historical aggregates from `path`, or starts empty if the file
    /// does not exist yet (first run).
    pub fn load_from_path(path: impl AsRef<Path>) -> TelemetryResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| TelemetryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let historical: HistoricalAggregates = serde_json::from_str(&raw)?;
        Ok(Self {
            current_calls: RwLock::new(Vec::new()),
            current_decisions: RwLock::new(Vec::new()),
            historical: RwLock::new(historical),
        })
    }

    /// Persists the (now updated) historical aggregates at run finalization.
    pub fn persist_to_path(&self, path: impl AsRef<Path>) -> TelemetryResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| TelemetryError::Write {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }
        let historical = self.historical.read().unwrap();
        let body = serde_json::to_string_pretty(&*historical)?;
        std::fs::write(path, body).map_err(|source| TelemetryError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Records one provider call outcome into both the current-run log and
    /// the cross-run historical aggregate for that provider.
    pub fn record_call(&self, task_id: &str, provider_id: &str, success: bool, latency_ms: u64, cost: f64, tokens: u32) {
        let record = CallRecord {
            task_id: task_id.to_string(),
            provider_id: provider_id.to_string(),
            success,
            latency_ms,
            cost,
            tokens,
            timestamp: Utc::now(),
        };
        self.current_calls.write().unwrap().push(record);

        let mut historical = self.historical.write().unwrap();
        let agg = historical.providers.entry(provider_id.to_string()).or_default();
        agg.total_calls += 1;
        if success {
            agg.successes += 1;
        }
        agg.cumulative_latency_ms += latency_ms;
        agg.cumulative_cost += cost;
        agg.cumulative_tokens += tokens as u64;
    }

    pub fn record_decision(&self, task_id: &str, provider_id: &str, score: f64) {
        self.current_decisions.write().unwrap().push(DecisionRecord {
            task_id: task_id.to_string(),
            provider_id: provider_id.to_string(),
            score,
            timestamp: Utc::now(),
        });
    }

    /// Derived stats for the router: success rate and mean latency/cost from
    /// historical aggregates, falling back to conservative defaults when the
    /// provider has no recorded history yet.
    pub fn provider_stats(&self, provider_id: &str, fallback_latency_ms: f64) -> ProviderStats {
        let historical = self.historical.read().unwrap();
        match historical.providers.get(provider_id) {
            Some(agg) if agg.total_calls > 0 => {
                let calls = agg.total_calls as f64;
                ProviderStats {
                    success_rate: agg.successes as f64 / calls,
                    avg_latency_ms: agg.cumulative_latency_ms as f64 / calls,
                    avg_cost: agg.cumulative_cost / calls,
                    has_history: true,
                }
            }
            _ => ProviderStats {
                success_rate: DEFAULT_SUCCESS_RATE,
                avg_latency_ms: fallback_latency_ms,
                avg_cost: 0.0,
                has_history: false,
            },
        }
    }

    pub fn current_calls(&self) -> Vec<CallRecord> {
        self.current_calls.read().unwrap().clone()
    }

    pub fn current_decisions(&self) -> Vec<DecisionRecord> {
        self.current_decisions.read().unwrap().clone()
    }

    pub fn total_cost(&self) -> f64 {
        self.current_calls.read().unwrap().iter().map(|c| c.cost).sum()
    }

    pub fn total_latency_ms(&self) -> u64 {
        self.current_calls.read().unwrap().iter().map(|c| c.latency_ms).sum()
    }
}
