//! Integration tests for routing, cache-aside and invalidation
//!
//! Drives the real router, registry, cache and caching dispatcher against
//! a scripted backend, checking tier selection and cache visibility across
//! calls.

use inference_coordination::cache::{CacheAside, MemoryCacheStore};
use inference_coordination::config::CoreConfig;
use inference_coordination::dispatch::{CachingDispatcher, Dispatcher, ScriptedBackend};
use inference_coordination::registry::{ModelRegistry, ModelTier};
use inference_coordination::router::{ComplexityClass, Router, RouterError};
use inference_coordination::task::{PriorityWeights, Task, TaskType};
use std::sync::Arc;
use std::time::Duration;

const MEMO: &str = "Short memo about the team lunch on Friday.";

struct Stack {
    router: Router,
    dispatcher: CachingDispatcher,
    cache: Arc<CacheAside>,
    registry: Arc<ModelRegistry>,
    backend: Arc<ScriptedBackend>,
}

fn stack() -> Stack {
    let config = CoreConfig::default();
    let registry = ModelRegistry::from_config(&config.registry)
        .expect("default catalog is valid")
        .shared();
    let cache = Arc::new(CacheAside::new(
        Arc::new(MemoryCacheStore::new()),
        config.cache.clone(),
    ));
    let backend = Arc::new(ScriptedBackend::new());
    let router = Router::from_config(&config, registry.clone(), cache.clone());
    let dispatcher = CachingDispatcher::new(
        Dispatcher::from_config(&config, backend.clone(), registry.clone()),
        cache.clone(),
    );
    Stack {
        router,
        dispatcher,
        cache,
        registry,
        backend,
    }
}

fn task(task_type: TaskType, doc_id: &str, content: &str, weights: PriorityWeights) -> Task {
    Task::builder(task_type, "acme", doc_id, Arc::from(content))
        .weights(weights)
        .build()
}

#[tokio::test]
async fn test_cost_heavy_weights_on_simple_content_select_fast_cheap() {
    let s = stack();
    for task_type in [TaskType::Summary, TaskType::ActionItems, TaskType::Embedding] {
        for cost_pct in (60..=100).step_by(5) {
            let cost = cost_pct as f64 / 100.0;
            let rest = 1.0 - cost;
            for speed_share in [0.0, 0.25, 0.5, 1.0] {
                let speed = rest * speed_share;
                let weights = PriorityWeights::new(cost, speed, rest - speed).unwrap();
                let t = task(task_type, "doc-grid", MEMO, weights);

                let decision = s.router.select(&t).await.unwrap();

                assert_eq!(decision.complexity, ComplexityClass::Simple);
                assert_eq!(
                    decision.tier,
                    ModelTier::FastCheap,
                    "type={} weights={:?}",
                    task_type,
                    weights
                );
            }
        }
    }
}

#[tokio::test]
async fn test_worked_weight_example_selects_fast_cheap_model() {
    let s = stack();
    let weights = PriorityWeights::new(0.8, 0.1, 0.1).unwrap();
    let decision = s
        .router
        .select(&task(TaskType::Summary, "doc-1", MEMO, weights))
        .await
        .unwrap();

    assert_eq!(decision.tier, ModelTier::FastCheap);
    assert_eq!(decision.model.as_deref(), Some("llama-3.1-8b-instruct"));
    assert!(!decision.cache_hit);
}

#[tokio::test]
async fn test_second_select_inside_ttl_is_cache_hit() {
    let s = stack();
    let weights = PriorityWeights::new(0.8, 0.1, 0.1).unwrap();

    let first = task(TaskType::Summary, "doc-1", MEMO, weights);
    let decision = s.router.select(&first).await.unwrap();
    let output = s.dispatcher.execute(&first, &decision).await.unwrap();
    assert!(!output.cache_hit);

    // A fresh task over identical content and type hits the same key.
    let second = task(TaskType::Summary, "doc-1", MEMO, weights);
    let decision = s.router.select(&second).await.unwrap();
    assert!(decision.cache_hit);
    assert_eq!(decision.cached_value, Some(output.value.clone()));

    let served = s.dispatcher.execute(&second, &decision).await.unwrap();
    assert!(served.cache_hit);
    assert_eq!(served.cost, 0.0);
    assert_eq!(s.backend.total_calls(), 1);
}

#[tokio::test]
async fn test_invalidate_document_forces_miss_before_ttl() {
    let s = stack();
    let weights = PriorityWeights::new(0.8, 0.1, 0.1).unwrap();

    let first = task(TaskType::Summary, "doc-1", MEMO, weights);
    let decision = s.router.select(&first).await.unwrap();
    s.dispatcher.execute(&first, &decision).await.unwrap();

    // Another document's entry must survive.
    let other = task(TaskType::Summary, "doc-2", "Different memo body.", weights);
    let decision = s.router.select(&other).await.unwrap();
    s.dispatcher.execute(&other, &decision).await.unwrap();

    let removed = s.cache.invalidate("acme", Some("doc-1")).await.unwrap();
    assert_eq!(removed, 1);

    let again = task(TaskType::Summary, "doc-1", MEMO, weights);
    assert!(!s.router.select(&again).await.unwrap().cache_hit);

    let other_again = task(TaskType::Summary, "doc-2", "Different memo body.", weights);
    assert!(s.router.select(&other_again).await.unwrap().cache_hit);
}

#[tokio::test]
async fn test_invalidate_all_clears_every_document_of_org() {
    let s = stack();
    let weights = PriorityWeights::default();
    for doc in ["doc-1", "doc-2", "doc-3"] {
        let t = task(TaskType::Summary, doc, MEMO, weights);
        let decision = s.router.select(&t).await.unwrap();
        s.dispatcher.execute(&t, &decision).await.unwrap();
    }

    assert_eq!(s.cache.invalidate_all("acme").await.unwrap(), 3);
    let t = task(TaskType::Summary, "doc-2", MEMO, weights);
    assert!(!s.router.select(&t).await.unwrap().cache_hit);
    assert_eq!(s.cache.stats().invalidated, 3);
}

#[tokio::test]
async fn test_empty_content_rejected_synchronously() {
    let s = stack();
    let t = task(TaskType::Summary, "doc-1", "  \n ", PriorityWeights::default());
    let err = s.router.select(&t).await.unwrap_err();
    assert!(matches!(err, RouterError::EmptyInput { .. }));
    assert!(!err.is_retryable());
    assert_eq!(s.backend.total_calls(), 0);
}

#[tokio::test]
async fn test_unknown_task_type_rejected() {
    let err = Router::parse_task_type("translate").unwrap_err();
    assert!(matches!(err, RouterError::InvalidTask(_)));
}

#[tokio::test]
async fn test_risk_never_routes_below_floor() {
    let s = stack();
    let weights = PriorityWeights::new(0.9, 0.05, 0.05).unwrap();
    let decision = s
        .router
        .select(&task(TaskType::Risk, "doc-1", MEMO, weights))
        .await
        .unwrap();

    assert_eq!(decision.complexity, ComplexityClass::Moderate);
    assert_ne!(decision.tier, ModelTier::FastCheap);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_skips_model_until_cooldown() {
    let s = stack();
    let weights = PriorityWeights::new(0.8, 0.1, 0.1).unwrap();
    for _ in 0..3 {
        s.registry.record_failure("llama-3.1-8b-instruct").unwrap();
    }
    assert!(!s.registry.is_available("llama-3.1-8b-instruct"));

    let decision = s
        .router
        .select(&task(TaskType::Summary, "doc-1", MEMO, weights))
        .await
        .unwrap();
    assert_eq!(decision.model.as_deref(), Some("mistral-small-instruct"));

    tokio::time::advance(Duration::from_secs(61)).await;
    let decision = s
        .router
        .select(&task(TaskType::Summary, "doc-2", MEMO, weights))
        .await
        .unwrap();
    assert_eq!(decision.model.as_deref(), Some("llama-3.1-8b-instruct"));
}

#[tokio::test(start_paused = true)]
async fn test_half_open_model_takes_one_probe_at_a_time() {
    let s = stack();
    let weights = PriorityWeights::new(0.8, 0.1, 0.1).unwrap();
    for _ in 0..3 {
        s.registry.record_failure("llama-3.1-8b-instruct").unwrap();
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    let probe = s.registry.try_acquire("llama-3.1-8b-instruct").unwrap();
    assert!(probe.is_probe());
    assert!(s.registry.try_acquire("llama-3.1-8b-instruct").is_none());

    // While the probe is out, other tasks go to the next model.
    let busy = task(TaskType::Summary, "doc-1", MEMO, weights);
    let decision = s.router.select(&busy).await.unwrap();
    assert_eq!(decision.model.as_deref(), Some("mistral-small-instruct"));
    let output = s.dispatcher.execute(&busy, &decision).await.unwrap();
    assert_eq!(output.model.as_deref(), Some("mistral-small-instruct"));
    assert_eq!(s.backend.call_count("llama-3.1-8b-instruct"), 0);

    drop(probe);
    let next = task(TaskType::Summary, "doc-2", MEMO, weights);
    let decision = s.router.select(&next).await.unwrap();
    assert_eq!(decision.model.as_deref(), Some("llama-3.1-8b-instruct"));
    let output = s.dispatcher.execute(&next, &decision).await.unwrap();
    assert_eq!(output.model.as_deref(), Some("llama-3.1-8b-instruct"));

    // The probe succeeded and closed the circuit.
    let first = s.registry.try_acquire("llama-3.1-8b-instruct").unwrap();
    let second = s.registry.try_acquire("llama-3.1-8b-instruct").unwrap();
    assert!(!first.is_probe() && !second.is_probe());
}

#[tokio::test]
async fn test_qa_questions_cache_separately() {
    let s = stack();
    let weights = PriorityWeights::new(0.8, 0.1, 0.1).unwrap();
    let qa = |question: &str| {
        Task::builder(TaskType::Qa, "acme", "doc-1", Arc::from(MEMO))
            .weights(weights)
            .question(question)
            .build()
    };

    let renewal = qa("When is renewal due?");
    let decision = s.router.select(&renewal).await.unwrap();
    assert!(!decision.cache_hit);
    s.dispatcher.execute(&renewal, &decision).await.unwrap();

    let price = qa("What is the price?");
    let decision = s.router.select(&price).await.unwrap();
    assert!(!decision.cache_hit);
    s.dispatcher.execute(&price, &decision).await.unwrap();
    assert_eq!(s.backend.total_calls(), 2);

    // Asking the first question again is served from cache.
    let again = qa("When is renewal due?");
    let decision = s.router.select(&again).await.unwrap();
    assert!(decision.cache_hit);
}
