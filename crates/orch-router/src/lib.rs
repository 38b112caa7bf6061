//! Router (spec §4.2): picks one provider for a task via a weighted sum of
//! five normalized sub-scores read off the capability registry.
//!
//! Generalized from `chimera-layer4::scheduler`'s priority-queue agent
//! selection, replacing "pick the next idle agent" with "score every
//! capability candidate and take the best", since providers are remote
//! services rather than locally spawned agent instances.

use orch_registry::CapabilityRegistry;
use orch_types::task::Task;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router weights sum to {0:.4}, which is not within 1% of 1.0")]
    WeightsNotNormalized(f64),
    #[error("no provider is known to the registry")]
    NoProviders,
}

pub type RouterResult<T> = Result<T, RouterError>;

/// Weights for the five sub-scores (spec §4.2 table). Must sum to 1.0 within
/// a 1% tolerance; `normalized()` rescales within tolerance and rejects
/// outside it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouterWeights {
    pub skill: f64,
    pub performance: f64,
    pub cost: f64,
    pub context_fit: f64,
    pub features: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            skill: 0.50,
            performance: 0.20,
            cost: 0.15,
            context_fit: 0.10,
            features: 0.05,
        }
    }
}

impl RouterWeights {
    fn sum(&self) -> f64 {
        self.skill + self.performance + self.cost + self.context_fit + self.features
    }

    /// Rescales the weights to sum to exactly 1.0, provided the current sum
    /// is within 1% of 1.0; otherwise rejects the configuration.
    pub fn normalized(self) -> RouterResult<Self> {
        let sum = self.sum();
        if (sum - 1.0).abs() > 0.01 {
            return Err(RouterError::WeightsNotNormalized(sum));
        }
        Ok(Self {
            skill: self.skill / sum,
            performance: self.performance / sum,
            cost: self.cost / sum,
            context_fit: self.context_fit / sum,
            features: self.features / sum,
        })
    }
}

/// Router configuration: normalized weights, per-task-kind overrides, and an
/// ordered fallback provider list for when no candidate survives filtering.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub weights: RouterWeights,
    pub overrides: HashMap<String, String>,
    pub fallback_providers: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            weights: RouterWeights::default(),
            overrides: HashMap::new(),
            fallback_providers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouterDecision<'a> {
    pub provider_id: &'a str,
    pub score: f64,
}

pub struct Router {
    config: RouterConfig,
}

impl Router {
    /// Validates that `config.weights` normalize before the router can be
    /// constructed; a misconfigured weight table is a startup-time error,
    /// not a per-call one.
    pub fn new(mut config: RouterConfig) -> RouterResult<Self> {
        config.weights = config.weights.normalized()?;
        Ok(Self { config })
    }

    /// Picks a provider id owned by the registry for `task`. `exclude` holds
    /// provider ids to skip (used by the repair/fallback controller to
    /// re-query with the failed provider removed).
    pub fn select(
        &self,
        registry: &CapabilityRegistry,
        task: &Task,
        exclude: &[String],
    ) -> RouterResult<(String, f64)> {
        if let Some(provider) = self.config.overrides.get(task.kind.as_str()) {
            if !exclude.contains(provider) && registry.lookup(provider).is_some() {
                let score = self.score_candidate(registry, provider, task);
                return Ok((provider.clone(), score));
            }
        }

        let context_tokens = task.requirements.context_tokens;
        let required_features = &task.requirements.required_features;

        let mut candidates: Vec<String> = registry
            .filter_by_feature(required_features)
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .filter(|id| match (context_tokens, registry.lookup(id)) {
                (Some(ctx), Some(cap)) => cap.context_window >= ctx,
                _ => true,
            })
            .collect();
        candidates.sort();

        if candidates.is_empty() {
            return self.fallback(registry, exclude);
        }

        let mut best: Option<(String, f64)> = None;
        for id in candidates {
            let score = self.score_candidate(registry, &id, task);
            best = match best {
                Some((best_id, best_score)) if best_score >= score => Some((best_id, best_score)),
                _ => Some((id, score)),
            };
        }
        best.ok_or(RouterError::NoProviders)
    }

    /// Last-resort path once no candidate has survived filtering. The
    /// configured `fallback_providers` are an explicit operator override of
    /// final resort, so they are tried regardless of `exclude` — the
    /// registry is consulted only for existence. Only the registry-wide
    /// `list_all` sweep below still honors `exclude`, since the router must
    /// never raise for well-formed inputs but returning a provider is still
    /// preferable to none even if it was already tried.
    fn fallback(&self, registry: &CapabilityRegistry, exclude: &[String]) -> RouterResult<(String, f64)> {
        for candidate in &self.config.fallback_providers {
            if registry.lookup(candidate).is_some() {
                return Ok((candidate.clone(), 0.0));
            }
        }
        registry
            .list_all()
            .into_iter()
            .find(|id| !exclude.contains(id))
            .or_else(|| registry.list_all().into_iter().next())
            .map(|id| (id, 0.0))
            .ok_or(RouterError::NoProviders)
    }

    fn score_candidate(&self, registry: &CapabilityRegistry, id: &str, task: &Task) -> f64 {
        let capability = match registry.lookup(id) {
            Some(c) => c,
            None => return 0.0,
        };
        let w = &self.config.weights;

        let skill = capability.skill_score(task.kind.as_str());

        let performance = 0.7 * (1.0 - capability.error_rate)
            + 0.3 * (1.0 - capability.avg_latency_ms / 10_000.0).max(0.0);

        let cost = 1.0 - (capability.cost_per_1k_tokens / 0.01).min(1.0);

        let context_fit = match task.requirements.context_tokens {
            None => 1.0,
            Some(ctx) => {
                let utilization = ctx as f64 / capability.context_window.max(1) as f64;
                if utilization < 0.2 {
                    0.8
                } else if utilization < 0.8 {
                    1.0
                } else {
                    0.6
                }
            }
        };

        let required = &task.requirements.required_features;
        let features = if required.is_empty() {
            1.0
        } else {
            let flags = capability.feature_flags();
            let supported = required.iter().filter(|f| flags.supports(f)).count();
            supported as f64 / required.len() as f64
        };

        w.skill * skill + w.performance * performance + w.cost * cost + w.context_fit * context_fit + w.features * features
    }
}
