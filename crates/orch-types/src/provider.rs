//! Provider adapter port: the narrow interface the repair/fallback
//! controller calls through. Concrete adapters (a deterministic mock, a
//! thin HTTP example) live at the top of the workspace, not here — this
//! module only fixes the contract: one method, `generate`, producing a
//! typed response record.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    pub model_id: String,
    pub finish_reason: String,
}

#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("provider {provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },
    #[error("provider {provider} request failed: {message}")]
    RequestFailed { provider: String, message: String },
    #[error("provider {provider} unknown to factory")]
    UnknownProvider { provider: String },
    #[error("run cancelled")]
    Cancelled,
}

/// A single method producing a typed record, called once per controller
/// attempt (primary, repair, or fallback).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError>;
}
