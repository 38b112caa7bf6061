//! Capability registry: the static per-provider-model capability table plus
//! the rolling telemetry log that keeps `error_rate`/`avg_latency_ms` fresh.
//!
//! Generalized from `chimera-layer4::model_loader`/`model_types`, which
//! loaded and cached locally-resident tensor models keyed by an enum; here
//! the registry holds remote provider/model capability records keyed by a
//! free-form model id, loaded once from a JSON configuration file.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orch_types::capability::CapabilityRecord;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read capabilities file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid capabilities JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// On-disk shape of the capabilities configuration (spec §6).
#[derive(Debug, Deserialize)]
struct CapabilitiesFile {
    #[serde(default = "default_window_hours")]
    telemetry_window_hours: i64,
    models: HashMap<String, CapabilityRecord>,
}

fn default_window_hours() -> i64 {
    24
}

/// One call outcome appended to a provider's rolling log.
#[derive(Debug, Clone, Copy)]
struct CallLogEntry {
    timestamp: DateTime<Utc>,
    success: bool,
    latency_ms: u64,
}

/// Keyed collection of capability records plus the append-only call log that
/// the router's performance sub-score and the skill/rank queries read from.
pub struct CapabilityRegistry {
    records: RwLock<HashMap<String, CapabilityRecord>>,
    call_log: RwLock<HashMap<String, Vec<CallLogEntry>>>,
    window: ChronoDuration,
}

pub const DEFAULT_SKILL_SCORE: f64 = orch_types::capability::DEFAULT_SKILL_SCORE;

impl CapabilityRegistry {
    /// Loads the capability table from a JSON file (spec §6). Synchronous:
    /// this only ever runs once, at engine startup.
    pub fn load_from_path(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: CapabilitiesFile = serde_json::from_str(&raw)?;
        Ok(Self {
            records: RwLock::new(file.models),
            call_log: RwLock::new(HashMap::new()),
            window: ChronoDuration::hours(file.telemetry_window_hours.max(1)),
        })
    }

    pub fn empty() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            call_log: RwLock::new(HashMap::new()),
            window: ChronoDuration::hours(24),
        }
    }

    pub fn from_records(records: HashMap<String, CapabilityRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            call_log: RwLock::new(HashMap::new()),
            window: ChronoDuration::hours(24),
        }
    }

    /// Looks up a capability record by provider/model id.
    pub fn lookup(&self, id: &str) -> Option<CapabilityRecord> {
        self.records.read().unwrap().get(id).cloned()
    }

    /// All known provider/model ids, in insertion-stable sorted order so
    /// callers (and tests) get deterministic iteration.
    pub fn list_all(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids whose capabilities support every required feature. An empty
    /// requirement list matches everything.
    pub fn filter_by_feature(&self, required_features: &[String]) -> Vec<String> {
        let records = self.records.read().unwrap();
        let mut ids: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.supports_all(required_features))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Skill score for an id/skill pair, defaulting to 0.5 when the id is
    /// unknown or the skill is absent from its skill vector (spec §4.1).
    pub fn skill_score(&self, id: &str, skill: &str) -> f64 {
        self.records
            .read()
            .unwrap()
            .get(id)
            .map(|r| r.skill_score(skill))
            .unwrap_or(DEFAULT_SKILL_SCORE)
    }

    /// Ranks all ids by `skill_score - error_rate * 0.2`, descending, ties
    /// broken by id for determinism. Used when the full weighted router
    /// score degrades to a rank-only fallback.
    pub fn rank_for_task_kind(&self, kind: &str) -> Vec<(String, f64)> {
        let records = self.records.read().unwrap();
        let mut ranked: Vec<(String, f64)> = records
            .iter()
            .map(|(id, record)| {
                let score = record.skill_score(kind) - record.error_rate * 0.2;
                (id.clone(), score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    /// Records one call outcome and recomputes the provider's derived
    /// `error_rate`/`avg_latency_ms` from calls still inside the telemetry
    /// window. Calls older than the window are pruned on every write so
    /// reads never need to filter.
    pub fn update_telemetry(&self, provider: &str, success: bool, latency_ms: u64) {
        let now = Utc::now();
        let cutoff = now - self.window;

        let mut log = self.call_log.write().unwrap();
        let entries = log.entry(provider.to_string()).or_default();
        entries.push(CallLogEntry {
            timestamp: now,
            success,
            latency_ms,
        });
        entries.retain(|e| e.timestamp >= cutoff);

        let total = entries.len() as f64;
        let failures = entries.iter().filter(|e| !e.success).count() as f64;
        let avg_latency = entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total;
        drop(log);

        if let Some(record) = self.records.write().unwrap().get_mut(provider) {
            record.error_rate = failures / total;
            record.avg_latency_ms = avg_latency;
        }
    }

    /// Number of calls for `provider` still inside the telemetry window, for
    /// tests asserting the pruning invariant.
    pub fn windowed_call_count(&self, provider: &str) -> usize {
        let cutoff = Utc::now() - self.window;
        self.call_log
            .read()
            .unwrap()
            .get(provider)
            .map(|entries| entries.iter().filter(|e| e.timestamp >= cutoff).count())
            .unwrap_or(0)
    }
}
