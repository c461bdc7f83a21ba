//! Async dispatch driver
//!
//! Executes the commands of a [`DispatchMachine`] against the registry, the
//! backend and `tokio::time`. Every backend call runs under
//! `min(tier timeout, time left before the caller deadline)`.

use super::backend::{BackendError, SharedBackend};
use super::errors::{DispatchError, DispatchResult};
use super::state_machine::{
    DispatchCommand, DispatchEvent, DispatchMachine, DispatchOutcome, Transition,
};
use crate::cache::SharedCacheAside;
use crate::config::{CoreConfig, PromptConfig, RetryConfig, TierTimeouts};
use crate::registry::{ModelTier, SharedModelRegistry};
use crate::router::{RoutingDecision, TaskPrompt};
use crate::task::{Task, TaskId, TaskType};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one backend attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    RateLimited,
    TimedOut,
    ServerError,
    Rejected,
    DeadlineElapsed,
}

/// One backend call made for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub model: String,
    pub tier: ModelTier,
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u64,
}

/// Successful task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub value: serde_json::Value,
    /// Model that produced the value, `None` when served from cache
    pub model: Option<String>,
    pub tier: ModelTier,
    pub cache_hit: bool,
    /// Cost of the successful call, zero on a cache hit
    pub cost: f64,
    pub attempts: u32,
    pub latency_ms: u64,
}

/// Full record of one dispatch, for logging and replay diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub task_id: TaskId,
    pub attempts: Vec<AttemptRecord>,
    pub transitions: Vec<Transition>,
    pub final_model: Option<String>,
    pub final_tier: ModelTier,
    pub cost: f64,
    pub outcome: Result<TaskOutput, DispatchError>,
}

impl DispatchReport {
    /// Get a compact summary for logging
    pub fn summary(&self) -> String {
        let status = match &self.outcome {
            Ok(out) if out.cache_hit => "cache_hit".to_string(),
            Ok(_) => "ok".to_string(),
            Err(e) => format!("error: {}", e),
        };
        format!(
            "task={} attempts={} tier={} model={} cost={:.4} {}",
            self.task_id,
            self.attempts.len(),
            self.final_tier,
            self.final_model.as_deref().unwrap_or("-"),
            self.cost,
            status
        )
    }
}

/// Executes routing decisions against backend models
pub struct Dispatcher {
    backend: SharedBackend,
    registry: SharedModelRegistry,
    retry: RetryConfig,
    timeouts: TierTimeouts,
    prompt: PromptConfig,
}

impl Dispatcher {
    pub fn new(
        backend: SharedBackend,
        registry: SharedModelRegistry,
        retry: RetryConfig,
        timeouts: TierTimeouts,
        prompt: PromptConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            retry,
            timeouts,
            prompt,
        }
    }

    /// Build from the layer config.
    pub fn from_config(
        config: &CoreConfig,
        backend: SharedBackend,
        registry: SharedModelRegistry,
    ) -> Self {
        Self::new(
            backend,
            registry,
            config.retry.clone(),
            config.timeouts.clone(),
            config.prompt.clone(),
        )
    }

    /// Execute `decision` for `task`, returning only the result.
    pub async fn execute(&self, task: &Task, decision: &RoutingDecision) -> DispatchResult<TaskOutput> {
        self.run(task, decision).await.outcome
    }

    /// Execute `decision` for `task`, returning the full report.
    pub async fn run(&self, task: &Task, decision: &RoutingDecision) -> DispatchReport {
        let started = Instant::now();
        let mut report = DispatchReport {
            task_id: task.id().to_string(),
            attempts: Vec::new(),
            transitions: Vec::new(),
            final_model: None,
            final_tier: decision.tier,
            cost: 0.0,
            outcome: Err(DispatchError::InvalidDecision {
                reason: "dispatch did not run".into(),
            }),
        };

        if let Err(e) = validate_decision(task, decision) {
            warn!(task_id = task.id(), error = %e, "dispatch: rejected decision");
            report.outcome = Err(e);
            return report;
        }

        let mut machine = DispatchMachine::new(
            task.id(),
            decision.tier,
            decision.model.clone(),
            &self.retry,
        )
        .with_accuracy_floor(decision.accuracy_floor);

        let prompt = TaskPrompt::for_task(task)
            .max_content_chars(self.prompt.max_content_chars)
            .build();
        let max_tokens = task.task_type().default_max_tokens();
        let mut output_text: Option<String> = None;

        let mut command = machine.step(
            DispatchEvent::Start {
                cache_hit: decision.cache_hit,
            },
            task.remaining(),
        );

        let outcome = loop {
            command = match command {
                DispatchCommand::ResolveTier { tier } => {
                    let event = match self.registry.resolve(
                        tier,
                        decision.accuracy_floor,
                        Some(task.weights()),
                    ) {
                        Ok((resolved, models)) => DispatchEvent::TierResolved {
                            tier: resolved,
                            models: models.into_iter().map(|m| m.name).collect(),
                        },
                        Err(_) => DispatchEvent::TierUnavailable { tier },
                    };
                    machine.step(event, task.remaining())
                }
                DispatchCommand::Invoke {
                    model,
                    tier,
                    attempt,
                } => {
                    // Held until the outcome is recorded; frees a half-open probe slot on drop.
                    let Some(_permit) = self.registry.try_acquire(&model) else {
                        debug!(
                            task_id = task.id(),
                            model = %model,
                            "dispatch: circuit refused admission"
                        );
                        command = machine.step(DispatchEvent::ModelUnavailable, task.remaining());
                        continue;
                    };
                    let limit = self.timeouts.for_tier(tier).min(task.remaining());
                    debug!(
                        task_id = task.id(),
                        model = %model,
                        tier = %tier,
                        attempt,
                        timeout_ms = limit.as_millis() as u64,
                        "dispatch: calling backend"
                    );
                    let call_started = Instant::now();
                    let result =
                        tokio::time::timeout(limit, self.backend.call(&model, &prompt, max_tokens))
                            .await;
                    let elapsed_ms = call_started.elapsed().as_millis() as u64;

                    let (event, attempt_outcome) = match result {
                        Ok(Ok(text)) => {
                            self.note_success(&model);
                            report.cost += self
                                .registry
                                .get(&model)
                                .map(|p| p.call_cost(max_tokens))
                                .unwrap_or(0.0);
                            output_text = Some(text);
                            (DispatchEvent::CallSucceeded, AttemptOutcome::Succeeded)
                        }
                        Ok(Err(BackendError::RateLimited(_))) => {
                            (DispatchEvent::CallRateLimited, AttemptOutcome::RateLimited)
                        }
                        Ok(Err(BackendError::Timeout(_))) | Err(_) => {
                            if task.is_expired() {
                                (DispatchEvent::DeadlineElapsed, AttemptOutcome::DeadlineElapsed)
                            } else {
                                self.note_failure(&model);
                                (DispatchEvent::CallTimedOut, AttemptOutcome::TimedOut)
                            }
                        }
                        Ok(Err(BackendError::Server(reason))) => {
                            self.note_failure(&model);
                            (
                                DispatchEvent::CallServerError { reason },
                                AttemptOutcome::ServerError,
                            )
                        }
                        Ok(Err(BackendError::Rejected(reason))) => (
                            DispatchEvent::CallRejected { reason },
                            AttemptOutcome::Rejected,
                        ),
                    };

                    if attempt_outcome != AttemptOutcome::Succeeded {
                        debug!(
                            task_id = task.id(),
                            model = %model,
                            attempt,
                            outcome = ?attempt_outcome,
                            "dispatch: attempt failed"
                        );
                    }
                    report.attempts.push(AttemptRecord {
                        attempt,
                        model,
                        tier,
                        outcome: attempt_outcome,
                        elapsed_ms,
                    });
                    machine.step(event, task.remaining())
                }
                DispatchCommand::Wait { delay } => {
                    debug!(
                        task_id = task.id(),
                        delay_ms = delay.as_millis() as u64,
                        "dispatch: backing off"
                    );
                    tokio::time::sleep(delay).await;
                    machine.step(DispatchEvent::WaitElapsed, task.remaining())
                }
                DispatchCommand::Finish(outcome) => break outcome,
            };
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let attempts = machine.attempts();
        report.final_tier = machine.tier();
        report.transitions = machine.into_history();

        report.outcome = match outcome {
            DispatchOutcome::CacheHit => match decision.cached_value.clone() {
                Some(value) => Ok(TaskOutput {
                    task_id: task.id().to_string(),
                    task_type: task.task_type(),
                    value,
                    model: None,
                    tier: decision.tier,
                    cache_hit: true,
                    cost: 0.0,
                    attempts: 0,
                    latency_ms,
                }),
                None => Err(DispatchError::InvalidDecision {
                    reason: "cache hit without a cached value".into(),
                }),
            },
            DispatchOutcome::Succeeded { model, tier } => {
                report.final_model = Some(model.clone());
                Ok(TaskOutput {
                    task_id: task.id().to_string(),
                    task_type: task.task_type(),
                    value: serde_json::Value::String(output_text.unwrap_or_default()),
                    model: Some(model),
                    tier,
                    cache_hit: false,
                    cost: report.cost,
                    attempts,
                    latency_ms,
                })
            }
            DispatchOutcome::Failed(err) => {
                report.final_model = report.attempts.last().map(|a| a.model.clone());
                Err(err)
            }
        };

        match &report.outcome {
            Ok(_) => info!(task_id = task.id(), "dispatch: {}", report.summary()),
            Err(e) => warn!(task_id = task.id(), error = %e, "dispatch: {}", report.summary()),
        }
        report
    }

    fn note_success(&self, model: &str) {
        if let Err(e) = self.registry.record_success(model) {
            warn!(model, error = %e, "dispatch: could not record success");
        }
    }

    fn note_failure(&self, model: &str) {
        if let Err(e) = self.registry.record_failure(model) {
            warn!(model, error = %e, "dispatch: could not record failure");
        }
    }
}

fn validate_decision(task: &Task, decision: &RoutingDecision) -> DispatchResult<()> {
    if decision.task_type != task.task_type() {
        return Err(DispatchError::InvalidDecision {
            reason: format!(
                "decision is for {} but task is {}",
                decision.task_type,
                task.task_type()
            ),
        });
    }
    if decision.cache_hit && decision.cached_value.is_none() {
        return Err(DispatchError::InvalidDecision {
            reason: "cache hit without a cached value".into(),
        });
    }
    if !decision.cache_hit && !task.task_type().requires_model() {
        return Err(DispatchError::InvalidDecision {
            reason: format!("{} tasks are not served by a backend", task.task_type()),
        });
    }
    Ok(())
}

/// Dispatcher with cache-aside write-back.
///
/// Successful results are written under the router's key with the TTL for
/// the task's nature. Failures are never cached.
pub struct CachingDispatcher {
    inner: Dispatcher,
    cache: SharedCacheAside,
}

impl CachingDispatcher {
    pub fn new(inner: Dispatcher, cache: SharedCacheAside) -> Self {
        Self { inner, cache }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner
    }

    pub async fn execute(&self, task: &Task, decision: &RoutingDecision) -> DispatchResult<TaskOutput> {
        self.run(task, decision).await.outcome
    }

    pub async fn run(&self, task: &Task, decision: &RoutingDecision) -> DispatchReport {
        let report = self.inner.run(task, decision).await;
        if let Ok(output) = &report.outcome {
            if !output.cache_hit {
                self.cache
                    .store(&decision.cache_key, task.task_type(), output.value.clone())
                    .await;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheAside, MemoryCacheStore};
    use crate::config::CacheTtlConfig;
    use crate::dispatch::backend::{ScriptStep, ScriptedBackend};
    use crate::registry::{ModelProfile, ModelRegistry};
    use crate::router::Router;
    use crate::task::PriorityWeights;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        router: Router,
        dispatcher: CachingDispatcher,
        backend: Arc<ScriptedBackend>,
    }

    fn harness(backend: ScriptedBackend) -> Harness {
        let config = CoreConfig::default();
        let registry = Arc::new(ModelRegistry::from_config(&config.registry).unwrap());
        let cache = Arc::new(CacheAside::new(
            Arc::new(MemoryCacheStore::new()),
            CacheTtlConfig::default(),
        ));
        let backend = Arc::new(backend);
        let router = Router::from_config(&config, registry.clone(), cache.clone());
        let dispatcher = CachingDispatcher::new(
            Dispatcher::from_config(&config, backend.clone(), registry),
            cache,
        );
        Harness {
            router,
            dispatcher,
            backend,
        }
    }

    fn cheap_task() -> Task {
        Task::builder(TaskType::Summary, "acme", "doc-1", Arc::from("Short memo."))
            .weights(PriorityWeights::new(0.8, 0.1, 0.1).unwrap())
            .build()
    }

    #[tokio::test]
    async fn test_success_reports_cost_and_caches() {
        let h = harness(ScriptedBackend::new());
        let task = cheap_task();
        let decision = h.router.select(&task).await.unwrap();
        let report = h.dispatcher.run(&task, &decision).await;

        let output = report.outcome.as_ref().unwrap();
        assert_eq!(output.model.as_deref(), Some("llama-3.1-8b-instruct"));
        assert_eq!(output.value, serde_json::json!("llama-3.1-8b-instruct: ok"));
        // 0.05 per 1k tokens, summary budget 1024 tokens
        assert!((report.cost - 0.0512).abs() < 1e-9);

        let again = h.router.select(&task).await.unwrap();
        assert!(again.cache_hit);
        let cached = h.dispatcher.execute(&task, &again).await.unwrap();
        assert!(cached.cache_hit);
        assert_eq!(cached.cost, 0.0);
        assert_eq!(h.backend.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let h = harness(ScriptedBackend::new().always(
            "llama-3.1-8b-instruct",
            ScriptStep::Fail(BackendError::Rejected("400".into())),
        ));
        let task = cheap_task();
        let decision = h.router.select(&task).await.unwrap();
        let err = h.dispatcher.execute(&task, &decision).await.unwrap_err();
        assert!(matches!(err, DispatchError::ModelError { .. }));
        assert!(!h.router.select(&task).await.unwrap().cache_hit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_fall_back_within_tier() {
        let h = harness(ScriptedBackend::new().always(
            "llama-3.1-8b-instruct",
            ScriptStep::Fail(BackendError::Server("503".into())),
        ));
        let task = cheap_task();
        let decision = h.router.select(&task).await.unwrap();
        let report = h.dispatcher.run(&task, &decision).await;
        let output = report.outcome.unwrap();
        assert_eq!(output.model.as_deref(), Some("mistral-small-instruct"));
        assert_eq!(output.attempts, 3);
        assert_eq!(h.backend.call_count("llama-3.1-8b-instruct"), 2);
    }

    #[tokio::test]
    async fn test_mismatched_decision_rejected() {
        let h = harness(ScriptedBackend::new());
        let task = cheap_task();
        let mut decision = h.router.select(&task).await.unwrap();
        decision.task_type = TaskType::Risk;
        let err = h.dispatcher.execute(&task, &decision).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidDecision { .. }));
        assert_eq!(h.backend.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_uses_tier_limit() {
        let h = harness(
            ScriptedBackend::new()
                .always("llama-3.1-8b-instruct", ScriptStep::Hang(Duration::from_secs(30))),
        );
        let task = cheap_task();
        let decision = h.router.select(&task).await.unwrap();
        let started = Instant::now();
        let report = h.dispatcher.run(&task, &decision).await;
        assert!(report.outcome.is_ok());
        // Two 10s fast_cheap timeouts on the first model, then the fallback answers.
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(report.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert_eq!(report.final_model.as_deref(), Some("mistral-small-instruct"));
    }
}
