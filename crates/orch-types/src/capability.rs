//! Capability record: the static, per-provider-model description loaded from
//! the capabilities configuration file. Describes a remote provider/model
//! pairing: per-task-kind skill scores, context window, cost, latency, and
//! feature support.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_function_calling: bool,
}

impl FeatureFlags {
    pub fn supports(&self, feature: &str) -> bool {
        match feature {
            "streaming" => self.supports_streaming,
            "vision" => self.supports_vision,
            "function_calling" | "function-calling" => self.supports_function_calling,
            _ => false,
        }
    }
}

/// Static capability description for one provider/model pairing, with the
/// derived rolling fields (`avg_latency_ms`, `error_rate`) updated in place
/// by the registry as telemetry arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub provider: String,
    #[serde(default)]
    pub skills: HashMap<String, f64>,
    pub context_window: u32,
    pub cost_per_1k_tokens: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_function_calling: bool,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_max_output_tokens() -> u32 {
    4096
}

/// Neutral skill score returned when a skill/task-kind is absent from the
/// capability's skill vector (§4.1 Skill score).
pub const DEFAULT_SKILL_SCORE: f64 = 0.5;

impl CapabilityRecord {
    pub fn skill_score(&self, skill: &str) -> f64 {
        self.skills.get(skill).copied().unwrap_or(DEFAULT_SKILL_SCORE)
    }

    pub fn feature_flags(&self) -> FeatureFlags {
        FeatureFlags {
            supports_streaming: self.supports_streaming,
            supports_vision: self.supports_vision,
            supports_function_calling: self.supports_function_calling,
        }
    }

    pub fn supports_all(&self, required_features: &[String]) -> bool {
        let flags = self.feature_flags();
        required_features.iter().all(|f| flags.supports(f))
    }
}
