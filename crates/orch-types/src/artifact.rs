//! Artifact and verification result types.
//!
//! An `Artifact` is one provider response bound to one task at one attempt,
//! generalized from `chimera-layer4::types::ExecutionResult` (a WASM agent's
//! output) to a provider/LLM call's output plus token accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Pass/fail classification plus per-criterion breakdown from the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub score: f64,
    pub criteria: HashMap<String, bool>,
    pub feedback: String,
    pub needs_repair: bool,
    pub fallback_recommended: bool,
    #[serde(default)]
    pub suggested_fixes: Vec<String>,
}

impl VerificationResult {
    pub fn empty_failure(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: 0.0,
            criteria: HashMap::new(),
            feedback: feedback.into(),
            needs_repair: true,
            fallback_recommended: true,
            suggested_fixes: Vec::new(),
        }
    }
}

/// The result of executing one task against one provider, at one attempt
/// (primary, repair, or fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub task_id: String,
    pub provider_id: String,
    pub prompt: String,
    pub response: String,
    pub tokens: TokenUsage,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub verification: Option<VerificationResult>,
    #[serde(default)]
    pub repair_count: u32,
    #[serde(default)]
    pub fallback_of: Option<String>,
    pub cost: f64,
    /// Set when this artifact represents a task that was cancelled before it
    /// ever acquired a concurrency permit, i.e. it never entered
    /// `RUNNING_*`. The scheduler treats these as `Skipped` rather than
    /// `Failed`.
    #[serde(default)]
    pub cancelled_before_start: bool,
}

impl Artifact {
    pub fn empty_failed(task_id: impl Into<String>, provider_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            provider_id: provider_id.into(),
            prompt: String::new(),
            response: String::new(),
            tokens: TokenUsage::default(),
            latency_ms: 0,
            timestamp: Utc::now(),
            success: false,
            error: Some(error.into()),
            verification: None,
            repair_count: 0,
            fallback_of: None,
            cost: 0.0,
            cancelled_before_start: false,
        }
    }

    /// A task that was cancelled while still queued for a concurrency
    /// permit, before its first provider call ever started.
    pub fn cancelled_before_dispatch(task_id: impl Into<String>) -> Self {
        Self {
            cancelled_before_start: true,
            ..Self::empty_failed(task_id, "", "cancelled before dispatch")
        }
    }
}
