//! Integration tests for dispatch resilience
//!
//! Runs routed tasks against scripted backends under paused tokio time so
//! backoff schedules, per-attempt timeouts and caller deadlines are
//! checked against exact virtual durations.

use inference_coordination::cache::{CacheAside, MemoryCacheStore};
use inference_coordination::config::CoreConfig;
use inference_coordination::dispatch::{
    AttemptOutcome, BackendError, CachingDispatcher, DispatchError, DispatchState, Dispatcher,
    ScriptStep, ScriptedBackend,
};
use inference_coordination::registry::{ModelRegistry, ModelTier};
use inference_coordination::router::Router;
use inference_coordination::task::{PriorityWeights, Task, TaskType};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const CHEAP: &str = "llama-3.1-8b-instruct";
const CHEAP_ALT: &str = "mistral-small-instruct";
const BALANCED: &str = "qwen2.5-32b-instruct";

struct Stack {
    router: Router,
    dispatcher: CachingDispatcher,
    cache: Arc<CacheAside>,
    backend: Arc<ScriptedBackend>,
}

fn stack(backend: ScriptedBackend) -> Stack {
    let config = CoreConfig::default();
    let registry = ModelRegistry::from_config(&config.registry)
        .expect("default catalog is valid")
        .shared();
    let cache = Arc::new(CacheAside::new(
        Arc::new(MemoryCacheStore::new()),
        config.cache.clone(),
    ));
    let backend = Arc::new(backend);
    let router = Router::from_config(&config, registry.clone(), cache.clone());
    let dispatcher = CachingDispatcher::new(
        Dispatcher::from_config(&config, backend.clone(), registry),
        cache.clone(),
    );
    Stack {
        router,
        dispatcher,
        cache,
        backend,
    }
}

fn cheap_task(timeout: Duration) -> Task {
    Task::builder(
        TaskType::Summary,
        "acme",
        "doc-1",
        Arc::from("Short memo about the team lunch on Friday."),
    )
    .weights(PriorityWeights::new(0.8, 0.1, 0.1).unwrap())
    .timeout(timeout)
    .build()
}

fn rate_limited() -> ScriptStep {
    ScriptStep::Fail(BackendError::RateLimited("429".into()))
}

fn server_error() -> ScriptStep {
    ScriptStep::Fail(BackendError::Server("503".into()))
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_backs_off_then_falls_back() {
    let s = stack(ScriptedBackend::new().always(CHEAP, rate_limited()));
    let task = cheap_task(Duration::from_secs(120));
    let started = Instant::now();

    let decision = s.router.select(&task).await.unwrap();
    let report = s.dispatcher.run(&task, &decision).await;
    let output = report.outcome.as_ref().unwrap();

    assert_eq!(output.model.as_deref(), Some(CHEAP_ALT));
    assert_eq!(output.tier, ModelTier::FastCheap);
    // One call plus three retries after 1s, 4s and 16s.
    assert_eq!(s.backend.call_count(CHEAP), 4);
    assert_eq!(s.backend.call_count(CHEAP_ALT), 1);

    let calls = s.backend.calls();
    let offsets: Vec<u64> = calls
        .iter()
        .map(|c| c.at.duration_since(started).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 1, 5, 21, 21]);

    let states: Vec<DispatchState> = report.transitions.iter().map(|t| t.to).collect();
    assert!(states.contains(&DispatchState::Retrying));
    assert!(states.contains(&DispatchState::FallbackModel));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_longer_than_deadline_skips_to_fallback() {
    let s = stack(ScriptedBackend::new().always(CHEAP, rate_limited()));
    let task = cheap_task(Duration::from_secs(3));

    let decision = s.router.select(&task).await.unwrap();
    let output = s.dispatcher.execute(&task, &decision).await.unwrap();

    // 1s wait fits, the 4s wait does not.
    assert_eq!(s.backend.call_count(CHEAP), 2);
    assert_eq!(output.model.as_deref(), Some(CHEAP_ALT));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_returns_timeout_without_full_chain() {
    let s = stack(ScriptedBackend::new().with_latency(Duration::from_secs(5)));
    let task = cheap_task(Duration::from_secs(2));
    let started = Instant::now();

    let decision = s.router.select(&task).await.unwrap();
    let err = s.dispatcher.execute(&task, &decision).await.unwrap_err();

    assert!(err.is_timeout(), "got {:?}", err);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2100), "took {:?}", elapsed);
    assert_eq!(s.backend.total_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tier_timeout_retries_once_then_falls_back() {
    let s = stack(
        ScriptedBackend::new().always(CHEAP, ScriptStep::Hang(Duration::from_secs(30))),
    );
    let task = cheap_task(Duration::from_secs(120));
    let started = Instant::now();

    let decision = s.router.select(&task).await.unwrap();
    let report = s.dispatcher.run(&task, &decision).await;

    let outcomes: Vec<AttemptOutcome> = report.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::TimedOut,
            AttemptOutcome::TimedOut,
            AttemptOutcome::Succeeded
        ]
    );
    // Two fast_cheap timeouts of 10s each.
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(report.final_model.as_deref(), Some(CHEAP_ALT));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_tier_escalates_to_next() {
    let s = stack(
        ScriptedBackend::new()
            .always(CHEAP, server_error())
            .always(CHEAP_ALT, server_error()),
    );
    let task = cheap_task(Duration::from_secs(120));

    let decision = s.router.select(&task).await.unwrap();
    assert_eq!(decision.tier, ModelTier::FastCheap);
    let report = s.dispatcher.run(&task, &decision).await;
    let output = report.outcome.as_ref().unwrap();

    assert_eq!(output.tier, ModelTier::Balanced);
    assert_eq!(output.model.as_deref(), Some(BALANCED));
    assert_eq!(output.attempts, 5);
    assert_eq!(report.final_tier, ModelTier::Balanced);
    assert!(report
        .transitions
        .iter()
        .any(|t| t.to == DispatchState::TierEscalated));
}

#[tokio::test(start_paused = true)]
async fn test_every_tier_failing_is_task_failed_and_not_cached() {
    let mut backend = ScriptedBackend::new();
    for model in [
        CHEAP,
        CHEAP_ALT,
        BALANCED,
        "llama-3.1-70b-instruct",
        "llama-3.1-405b-instruct",
    ] {
        backend = backend.always(model, server_error());
    }
    let s = stack(backend);
    let task = cheap_task(Duration::from_secs(600));

    let decision = s.router.select(&task).await.unwrap();
    let err = s.dispatcher.execute(&task, &decision).await.unwrap_err();

    match &err {
        DispatchError::TaskFailed { attempts, last, .. } => {
            assert_eq!(*attempts, 10);
            assert!(matches!(**last, DispatchError::ModelError { .. }));
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    assert_eq!(s.cache.stats().writes, 0);

    let retry = cheap_task(Duration::from_secs(600));
    assert!(!s.router.select(&retry).await.unwrap().cache_hit);
}

#[tokio::test(start_paused = true)]
async fn test_rejection_fails_immediately() {
    let s = stack(
        ScriptedBackend::new().always(CHEAP, ScriptStep::Fail(BackendError::Rejected("400".into()))),
    );
    let task = cheap_task(Duration::from_secs(120));

    let decision = s.router.select(&task).await.unwrap();
    let err = s.dispatcher.execute(&task, &decision).await.unwrap_err();

    assert!(matches!(err, DispatchError::ModelError { .. }));
    assert!(!err.is_retryable());
    assert_eq!(s.backend.total_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_report_serialises_for_replay() {
    let s = stack(ScriptedBackend::new().script(CHEAP, [rate_limited()]));
    let task = cheap_task(Duration::from_secs(120));

    let decision = s.router.select(&task).await.unwrap();
    let report = s.dispatcher.run(&task, &decision).await;

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["attempts"].as_array().unwrap().len(), 2);
    let decision_json = serde_json::to_string(&decision).unwrap();
    assert!(decision_json.contains("model_selected"));
}
