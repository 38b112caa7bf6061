//! Per-task repair/fallback controller (spec §4.5): drives one task through
//! primary execution, bounded repair, and single fallback, against the
//! state machine `PENDING -> RUNNING_PRIMARY -> VERIFYING_PRIMARY ->
//! (RUNNING_REPAIR -> VERIFYING_REPAIR)* -> RUNNING_FALLBACK ->
//! VERIFYING_FALLBACK -> DONE`, with any provider error short-circuiting
//! straight to `FAILED`.
//!
//! Generalized from `chimera-layer3`'s agent dispatch retry loop (a fixed
//! number of attempts against the same backend), widened to also swap
//! providers once the repair budget is exhausted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use orch_registry::CapabilityRegistry;
use orch_router::Router;
use orch_telemetry::TelemetryCollector;
use orch_types::artifact::{Artifact, TokenUsage};
use orch_types::events::{ArtifactSummary, EngineEvent, EventSender, VerificationSummary};
use orch_types::provider::{GenerateRequest, ProviderAdapter, ProviderError};
use orch_types::task::Task;
use orch_verifier::Verifier;
use tokio_util::sync::CancellationToken;

use crate::limiter::ConcurrencyLimiter;

/// Narrow lookup the controller needs to turn a provider id into a callable
/// adapter. Concrete provider construction/caching (`ProviderFactory`) lives
/// at the top of the workspace; the controller only needs this much.
pub trait ProviderLookup: Send + Sync {
    fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Primary,
    Repair,
    Fallback,
}

pub struct TaskExecutor<'a> {
    pub router: &'a Router,
    pub registry: &'a CapabilityRegistry,
    pub verifier: &'a Verifier,
    pub providers: &'a dyn ProviderLookup,
    pub limiter: &'a ConcurrencyLimiter,
    pub telemetry: &'a TelemetryCollector,
    pub repair_limit: u32,
    pub call_timeout: Duration,
}

impl<'a> TaskExecutor<'a> {
    /// Runs `task` to a terminal artifact. Always returns; errors are
    /// encoded in the artifact's `success`/`error` fields rather than
    /// propagated, since one task's failure must not abort sibling tasks
    /// already in flight.
    pub async fn run(&self, task: &Task, events: &EventSender, cancel: &CancellationToken) -> Artifact {
        let mut excluded: Vec<String> = Vec::new();
        let mut repair_count: u32 = 0;
        let mut last_artifact: Option<Artifact> = None;
        let mut phase = Phase::Primary;
        // Becomes true once the task has actually entered RUNNING_* for the
        // first time (held a concurrency permit). Cancellation observed
        // before that point means the task never started, so it is skipped
        // rather than failed; cancellation observed after means it was
        // really running and is failed with cause cancelled.
        let mut dispatched = false;

        loop {
            if cancel.is_cancelled() {
                return if dispatched {
                    self.fail(task, events, "run cancelled").await
                } else {
                    Artifact::cancelled_before_dispatch(&task.id)
                };
            }

            let (provider_id, decision) = match phase {
                Phase::Repair => (
                    last_artifact
                        .as_ref()
                        .expect("repair phase always follows a primary attempt")
                        .provider_id
                        .clone(),
                    None,
                ),
                Phase::Primary | Phase::Fallback => match self.router.select(self.registry, task, &excluded) {
                    Ok((id, score)) => (id.clone(), Some(score)),
                    Err(_) => return self.fail(task, events, "no provider available").await,
                },
            };

            let adapter = match self.providers.get(&provider_id) {
                Some(adapter) => adapter,
                None => return self.fail(task, events, format!("unknown provider: {provider_id}")).await,
            };

            let permit = match self.limiter.acquire(&provider_id, cancel).await {
                Ok(permit) => permit,
                Err(_) => {
                    return if dispatched {
                        self.fail(task, events, "run cancelled while waiting for capacity").await
                    } else {
                        Artifact::cancelled_before_dispatch(&task.id)
                    };
                }
            };

            // Capacity secured: the task is now truly RUNNING_*. Emit the
            // lifecycle events that were deferred until admission, so a task
            // cancelled while still queued never appears to have started.
            if !dispatched {
                let _ = events
                    .send(EngineEvent::TaskStart {
                        task_id: task.id.clone(),
                        description: task.description.clone(),
                    })
                    .await;
                dispatched = true;
            }
            if let Some(score) = decision {
                self.telemetry.record_decision(&task.id, &provider_id, score);
                let _ = events
                    .send(EngineEvent::Decision {
                        task_id: task.id.clone(),
                        provider_id: provider_id.clone(),
                        score,
                    })
                    .await;
                if phase == Phase::Fallback {
                    let _ = events
                        .send(EngineEvent::TaskFallback {
                            task_id: task.id.clone(),
                            excluded_provider: excluded.last().cloned().unwrap_or_default(),
                        })
                        .await;
                }
            }

            let prompt = match phase {
                Phase::Repair => repair_prompt(task, last_artifact.as_ref().unwrap()),
                Phase::Primary | Phase::Fallback => task.description.clone(),
            };

            let request = GenerateRequest::new(prompt.clone());
            let started = Instant::now();
            let outcome = tokio::select! {
                result = tokio::time::timeout(self.call_timeout, adapter.generate(request)) => result,
                _ = cancel.cancelled() => Ok(Err(ProviderError::Cancelled)),
            };
            drop(permit);
            let latency_ms = started.elapsed().as_millis() as u64;

            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return self.fail_provider_error(task, &provider_id, latency_ms, events, err).await,
                Err(_) => {
                    return self
                        .fail_provider_error(
                            task,
                            &provider_id,
                            latency_ms,
                            events,
                            ProviderError::Timeout {
                                provider: provider_id.clone(),
                                timeout_ms: self.call_timeout.as_millis() as u64,
                            },
                        )
                        .await
                }
            };

            self.telemetry.record_call(
                &task.id,
                &provider_id,
                true,
                latency_ms,
                response.cost,
                response.input_tokens + response.output_tokens,
            );
            self.registry.update_telemetry(&provider_id, true, latency_ms);

            let mut artifact = Artifact {
                task_id: task.id.clone(),
                provider_id: provider_id.clone(),
                prompt,
                response: response.content,
                tokens: TokenUsage {
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                },
                latency_ms,
                timestamp: chrono::Utc::now(),
                success: true,
                error: None,
                verification: None,
                repair_count,
                fallback_of: if phase == Phase::Fallback { excluded.last().cloned() } else { None },
                cost: response.cost,
                cancelled_before_start: false,
            };

            let _ = events
                .send(EngineEvent::TaskArtifact {
                    task_id: task.id.clone(),
                    artifact: ArtifactSummary::from(&artifact),
                })
                .await;

            let verification = self.verifier.verify(&artifact, task);
            let _ = events
                .send(EngineEvent::TaskVerified {
                    task_id: task.id.clone(),
                    verification: VerificationSummary::from(&verification),
                })
                .await;
            let passed = verification.passed;
            artifact.verification = Some(verification);

            if passed {
                return artifact;
            }

            match phase {
                Phase::Fallback => {
                    // VERIFYING_FALLBACK always terminates in DONE, pass or
                    // fail: there is nowhere left to escalate to.
                    return artifact;
                }
                Phase::Primary | Phase::Repair => {
                    if repair_count < self.repair_limit {
                        repair_count += 1;
                        last_artifact = Some(artifact);
                        phase = Phase::Repair;
                        let _ = events
                            .send(EngineEvent::TaskRepaired {
                                task_id: task.id.clone(),
                                attempt: repair_count,
                            })
                            .await;
                    } else {
                        excluded.push(provider_id.clone());
                        last_artifact = Some(artifact);
                        phase = Phase::Fallback;
                    }
                }
            }
        }
    }

    async fn fail(&self, task: &Task, events: &EventSender, error: impl Into<String>) -> Artifact {
        let error = error.into();
        let _ = events
            .send(EngineEvent::TaskFailed {
                task_id: task.id.clone(),
                error: error.clone(),
            })
            .await;
        Artifact::empty_failed(&task.id, "", error)
    }

    async fn fail_provider_error(
        &self,
        task: &Task,
        provider_id: &str,
        latency_ms: u64,
        events: &EventSender,
        err: ProviderError,
    ) -> Artifact {
        self.telemetry.record_call(&task.id, provider_id, false, latency_ms, 0.0, 0);
        self.registry.update_telemetry(provider_id, false, latency_ms);
        let error = err.to_string();
        let _ = events
            .send(EngineEvent::TaskFailed {
                task_id: task.id.clone(),
                error: error.clone(),
            })
            .await;
        Artifact::empty_failed(&task.id, provider_id, error)
    }
}

/// Builds the repair attempt's prompt: the original instructions, the prior
/// attempt's output, and the verifier's suggested fixes, so the same
/// provider gets concrete guidance rather than a bare retry.
fn repair_prompt(task: &Task, previous: &Artifact) -> String {
    let feedback = previous
        .verification
        .as_ref()
        .map(|v| v.suggested_fixes.join("; "))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "the previous response did not meet quality requirements".to_string());

    format!(
        "{instructions}\n\nYour previous attempt was:\n{previous_response}\n\nThat attempt failed review for the \
         following reasons: {feedback}. Revise your response to address them.",
        instructions = task.description,
        previous_response = previous.response,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orch_router::RouterConfig;
    use orch_types::capability::CapabilityRecord;
    use orch_types::task::TaskKind;
    use std::collections::HashMap as Map;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Always returns the same fixed response, or an error if configured to.
    struct ScriptedAdapter {
        responses: Mutex<Vec<Result<&'static str, ProviderError>>>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn generate(&self, _request: GenerateRequest) -> Result<orch_types::provider::GenerateResponse, ProviderError> {
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 { responses.remove(0) } else { responses[0].clone() };
            next.map(|content| orch_types::provider::GenerateResponse {
                content: content.to_string(),
                input_tokens: 10,
                output_tokens: 20,
                cost: 0.001,
                model_id: "scripted".to_string(),
                finish_reason: "stop".to_string(),
            })
        }
    }

    struct FixedLookup(Map<String, Arc<dyn ProviderAdapter>>);

    impl ProviderLookup for FixedLookup {
        fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
            self.0.get(provider_id).cloned()
        }
    }

    fn capability() -> CapabilityRecord {
        CapabilityRecord {
            provider: "m1".into(),
            skills: Map::new(),
            context_window: 100_000,
            cost_per_1k_tokens: 0.003,
            avg_latency_ms: 500.0,
            error_rate: 0.0,
            supports_streaming: false,
            supports_vision: false,
            supports_function_calling: false,
            max_output_tokens: 4096,
        }
    }

    fn task() -> Task {
        let mut t = Task::new("t1", "write something", TaskKind::Generate);
        t.quality_criteria = vec!["non-empty".to_string()];
        t
    }

    #[tokio::test]
    async fn good_primary_response_completes_without_repair() {
        let registry = CapabilityRegistry::from_records(Map::from([("m1".to_string(), capability())]));
        let router = Router::new(RouterConfig::default()).unwrap();
        let verifier = Verifier::new();
        let limiter = ConcurrencyLimiter::new(4, 4);
        let telemetry = TelemetryCollector::new();
        let providers: Map<String, Arc<dyn ProviderAdapter>> = Map::from([(
            "m1".to_string(),
            Arc::new(ScriptedAdapter {
                responses: Mutex::new(vec![Ok(
                    "The task completed successfully and is fully implemented and verified here.",
                )]),
            }) as Arc<dyn ProviderAdapter>,
        )]);
        let lookup = FixedLookup(providers);

        let executor = TaskExecutor {
            router: &router,
            registry: &registry,
            verifier: &verifier,
            providers: &lookup,
            limiter: &limiter,
            telemetry: &telemetry,
            repair_limit: 1,
            call_timeout: Duration::from_secs(5),
        };

        let (tx, _rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let artifact = executor.run(&task(), &tx, &cancel).await;
        assert!(artifact.success);
        assert!(artifact.verification.unwrap().passed);
        assert_eq!(artifact.repair_count, 0);
    }

    #[tokio::test]
    async fn provider_error_fails_immediately_without_repair() {
        let registry = CapabilityRegistry::from_records(Map::from([("m1".to_string(), capability())]));
        let router = Router::new(RouterConfig::default()).unwrap();
        let verifier = Verifier::new();
        let limiter = ConcurrencyLimiter::new(4, 4);
        let telemetry = TelemetryCollector::new();
        let providers: Map<String, Arc<dyn ProviderAdapter>> = Map::from([(
            "m1".to_string(),
            Arc::new(ScriptedAdapter {
                responses: Mutex::new(vec![Err(ProviderError::RequestFailed {
                    provider: "m1".to_string(),
                    message: "upstream 500".to_string(),
                })]),
            }) as Arc<dyn ProviderAdapter>,
        )]);
        let lookup = FixedLookup(providers);

        let executor = TaskExecutor {
            router: &router,
            registry: &registry,
            verifier: &verifier,
            providers: &lookup,
            limiter: &limiter,
            telemetry: &telemetry,
            repair_limit: 2,
            call_timeout: Duration::from_secs(5),
        };

        let (tx, _rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let artifact = executor.run(&task(), &tx, &cancel).await;
        assert!(!artifact.success);
        assert!(artifact.error.unwrap().contains("upstream 500"));
    }

    #[tokio::test]
    async fn poor_response_repairs_then_passes() {
        let registry = CapabilityRegistry::from_records(Map::from([("m1".to_string(), capability())]));
        let router = Router::new(RouterConfig::default()).unwrap();
        let verifier = Verifier::new();
        let limiter = ConcurrencyLimiter::new(4, 4);
        let telemetry = TelemetryCollector::new();
        let providers: Map<String, Arc<dyn ProviderAdapter>> = Map::from([(
            "m1".to_string(),
            Arc::new(ScriptedAdapter {
                responses: Mutex::new(vec![
                    Ok("TODO"),
                    Ok("The task completed successfully and is fully implemented and verified here."),
                ]),
            }) as Arc<dyn ProviderAdapter>,
        )]);
        let lookup = FixedLookup(providers);

        let executor = TaskExecutor {
            router: &router,
            registry: &registry,
            verifier: &verifier,
            providers: &lookup,
            limiter: &limiter,
            telemetry: &telemetry,
            repair_limit: 1,
            call_timeout: Duration::from_secs(5),
        };

        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let artifact = executor.run(&task(), &tx, &cancel).await;
        drop(tx);

        assert!(artifact.success);
        assert_eq!(artifact.repair_count, 1);

        let mut saw_repair_event = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, EngineEvent::TaskRepaired { .. }) {
                saw_repair_event = true;
            }
        }
        assert!(saw_repair_event);
    }

    #[tokio::test]
    async fn repair_budget_exhausted_falls_back_to_another_provider() {
        let mut records = Map::new();
        records.insert("m1".to_string(), capability());
        let mut m2 = capability();
        m2.provider = "m2".into();
        records.insert("m2".to_string(), m2);
        let registry = CapabilityRegistry::from_records(records);

        let router = Router::new(RouterConfig::default()).unwrap();
        let verifier = Verifier::new();
        let limiter = ConcurrencyLimiter::new(4, 4);
        let telemetry = TelemetryCollector::new();
        let providers: Map<String, Arc<dyn ProviderAdapter>> = Map::from([
            (
                "m1".to_string(),
                Arc::new(ScriptedAdapter {
                    responses: Mutex::new(vec![Ok("TODO")]),
                }) as Arc<dyn ProviderAdapter>,
            ),
            (
                "m2".to_string(),
                Arc::new(ScriptedAdapter {
                    responses: Mutex::new(vec![Ok(
                        "The task completed successfully and is fully implemented and verified here.",
                    )]),
                }) as Arc<dyn ProviderAdapter>,
            ),
        ]);
        let lookup = FixedLookup(providers);

        let executor = TaskExecutor {
            router: &router,
            registry: &registry,
            verifier: &verifier,
            providers: &lookup,
            limiter: &limiter,
            telemetry: &telemetry,
            repair_limit: 0,
            call_timeout: Duration::from_secs(5),
        };

        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let artifact = executor.run(&task(), &tx, &cancel).await;
        drop(tx);

        assert!(artifact.success);
        assert_eq!(artifact.fallback_of, Some("m1".to_string()));

        let mut saw_fallback_event = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, EngineEvent::TaskFallback { .. }) {
                saw_fallback_event = true;
            }
        }
        assert!(saw_fallback_event);
    }
}
