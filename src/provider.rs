//! Concrete provider adapters. The controller only ever sees
//! `orch_types::provider::ProviderAdapter`; this module supplies the two
//! implementations that actually exist in this workspace — a deterministic
//! mock used by every test and the CLI's default mode, and a thin
//! `reqwest`-based HTTP adapter behind the `http-provider` feature that
//! demonstrates the shape a real vendor integration would take.
//!
//! `ProviderFactory` constructs and caches one adapter per provider id for
//! the process lifetime rather than constructing a fresh adapter per call.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use orch_types::provider::{GenerateRequest, GenerateResponse, ProviderAdapter, ProviderError};
use rand::Rng;

/// Deterministic, network-free adapter. Every response is derived from the
/// prompt's content rather than randomness, except for a configurable
/// failure rate used to exercise the repair/fallback paths in tests and
/// demos without a live backend.
pub struct MockProviderAdapter {
    model_id: String,
    cost_per_1k_tokens: f64,
    failure_rate: f64,
    simulated_latency: Duration,
}

impl MockProviderAdapter {
    pub fn new(model_id: impl Into<String>, cost_per_1k_tokens: f64) -> Self {
        Self {
            model_id: model_id.into(),
            cost_per_1k_tokens,
            failure_rate: 0.0,
            simulated_latency: Duration::from_millis(50),
        }
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_simulated_latency(mut self, latency: Duration) -> Self {
        self.simulated_latency = latency;
        self
    }
}

#[async_trait]
impl ProviderAdapter for MockProviderAdapter {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        tokio::time::sleep(self.simulated_latency).await;

        if self.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.failure_rate {
            return Err(ProviderError::RequestFailed {
                provider: self.model_id.clone(),
                message: "simulated transient failure".to_string(),
            });
        }

        let input_tokens = estimate_tokens(&request.prompt);
        let content = format!(
            "Completed: {}. The requested work has been addressed successfully and verified for correctness and completeness.",
            request.prompt.chars().take(120).collect::<String>()
        );
        let output_tokens = estimate_tokens(&content);
        let cost = (input_tokens + output_tokens) as f64 / 1000.0 * self.cost_per_1k_tokens;

        Ok(GenerateResponse {
            content,
            input_tokens,
            output_tokens,
            cost,
            model_id: self.model_id.clone(),
            finish_reason: "stop".to_string(),
        })
    }
}

fn estimate_tokens(text: &str) -> u32 {
    (text.split_whitespace().count() as u32).max(1)
}

/// Thin example HTTP adapter, gated behind `http-provider`, demonstrating
/// the shape a real vendor integration takes without shipping one. Expects
/// an OpenAI-compatible chat-completions endpoint.
#[cfg(feature = "http-provider")]
pub struct HttpProviderAdapter {
    model_id: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

#[cfg(feature = "http-provider")]
impl HttpProviderAdapter {
    pub fn new(model_id: impl Into<String>, endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "http-provider")]
#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        #[derive(serde::Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            max_tokens: Option<u32>,
            temperature: Option<f32>,
        }

        #[derive(serde::Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(serde::Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
            usage: ChatUsage,
        }

        #[derive(serde::Deserialize)]
        struct ChatChoice {
            message: ChatResponseMessage,
            finish_reason: String,
        }

        #[derive(serde::Deserialize)]
        struct ChatResponseMessage {
            content: String,
        }

        #[derive(serde::Deserialize)]
        struct ChatUsage {
            prompt_tokens: u32,
            completion_tokens: u32,
        }

        let mut messages = Vec::new();
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: &request.prompt });

        let body = ChatRequest {
            model: &self.model_id,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::RequestFailed {
                provider: self.model_id.clone(),
                message: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ProviderError::RequestFailed {
                provider: self.model_id.clone(),
                message: format!("http status {}", response.status()),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|err| ProviderError::RequestFailed {
            provider: self.model_id.clone(),
            message: err.to_string(),
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| ProviderError::RequestFailed {
            provider: self.model_id.clone(),
            message: "empty choices array".to_string(),
        })?;

        Ok(GenerateResponse {
            content: choice.message.content,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
            cost: 0.0,
            model_id: self.model_id.clone(),
            finish_reason: choice.finish_reason,
        })
    }
}

/// Constructs and caches one adapter per provider/model id for the process
/// lifetime, keyed by provider id.
pub struct ProviderFactory {
    cache: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    cost_per_1k: HashMap<String, f64>,
}

impl ProviderFactory {
    pub fn new(cost_per_1k: HashMap<String, f64>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            cost_per_1k,
        }
    }

    pub fn get(&self, provider_id: &str) -> Arc<dyn ProviderAdapter> {
        if let Some(adapter) = self.cache.read().unwrap().get(provider_id) {
            return adapter.clone();
        }
        let cost = self.cost_per_1k.get(provider_id).copied().unwrap_or(0.003);
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(MockProviderAdapter::new(provider_id, cost));
        self.cache.write().unwrap().insert(provider_id.to_string(), adapter.clone());
        adapter
    }
}

impl orch_scheduler::ProviderLookup for ProviderFactory {
    fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        Some(ProviderFactory::get(self, provider_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_adapter_returns_non_placeholder_response() {
        let adapter = MockProviderAdapter::new("m1", 0.003);
        let response = adapter.generate(GenerateRequest::new("write a haiku")).await.unwrap();
        assert!(response.content.len() > 10);
        assert!(response.output_tokens > 0);
    }

    #[tokio::test]
    async fn mock_adapter_honors_failure_rate() {
        let adapter = MockProviderAdapter::new("m1", 0.003).with_failure_rate(1.0);
        let result = adapter.generate(GenerateRequest::new("anything")).await;
        assert!(result.is_err());
    }

    #[test]
    fn factory_caches_instances_by_provider_id() {
        let factory = ProviderFactory::new(HashMap::new());
        let a = factory.get("m1");
        let b = factory.get("m1");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
