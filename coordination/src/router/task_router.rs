//! Task router
//!
//! Turns a [`Task`] into exactly one [`RoutingDecision`]:
//!
//! 1. assess complexity
//! 2. pick a candidate tier from complexity and caller weights
//! 3. check the cache under `(content_hash, task_type, candidate_tier)`
//! 4. on a miss, resolve the best available model at or above the
//!    candidate tier that meets the task type's accuracy floor
//!
//! # Tier Selection
//!
//! ```text
//! Condition                                   | Candidate tier
//! --------------------------------------------|---------------
//! class = complex  OR accuracy > 0.6          | premium
//! cost >= 0.6      AND class = simple         | fast_cheap
//! otherwise                                   | balanced
//! ```

use super::classifier::{ComplexityAssessor, ComplexityClass};
use super::decision::{DecisionTrace, RoutingDecision, TraceStep};
use crate::cache::{CacheKey, SharedCacheAside};
use crate::config::{AccuracyFloors, CoreConfig, RouterConfig};
use crate::registry::{AccuracyClass, ModelTier, RegistryError, SharedModelRegistry};
use crate::task::{PriorityWeights, Task, TaskError, TaskType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Errors raised while routing
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RouterError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Empty input for {task_type} task on document {doc_id}")]
    EmptyInput { task_type: TaskType, doc_id: String },

    #[error("No model available from tier {tier} meeting accuracy floor {floor}")]
    RegistryExhausted {
        tier: ModelTier,
        floor: AccuracyClass,
    },
}

impl RouterError {
    /// Invalid input is never retried; exhaustion may clear once circuits cool down.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RegistryExhausted { .. })
    }
}

impl From<TaskError> for RouterError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::EmptyInput { task_type, doc_id } => Self::EmptyInput { task_type, doc_id },
            other => Self::InvalidTask(other.to_string()),
        }
    }
}

/// Result type for routing operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Candidate tier for a complexity class and weight vector.
pub fn candidate_tier(
    class: ComplexityClass,
    weights: &PriorityWeights,
    config: &RouterConfig,
) -> (ModelTier, &'static str) {
    if class == ComplexityClass::Complex {
        (ModelTier::Premium, "complex content")
    } else if weights.accuracy() > config.premium_accuracy_weight {
        (ModelTier::Premium, "accuracy weight")
    } else if class == ComplexityClass::Simple && weights.cost() >= config.cheap_cost_weight {
        (ModelTier::FastCheap, "cost weight on simple content")
    } else {
        (ModelTier::Balanced, "default")
    }
}

/// Routes tasks to a tier and model, consulting the cache first
pub struct Router {
    assessor: ComplexityAssessor,
    config: RouterConfig,
    floors: AccuracyFloors,
    registry: SharedModelRegistry,
    cache: SharedCacheAside,
}

impl Router {
    pub fn new(
        assessor: ComplexityAssessor,
        config: RouterConfig,
        floors: AccuracyFloors,
        registry: SharedModelRegistry,
        cache: SharedCacheAside,
    ) -> Self {
        Self {
            assessor,
            config,
            floors,
            registry,
            cache,
        }
    }

    /// Build from the layer config.
    pub fn from_config(
        config: &CoreConfig,
        registry: SharedModelRegistry,
        cache: SharedCacheAside,
    ) -> Self {
        Self::new(
            ComplexityAssessor::new(config.assessor.clone()),
            config.router.clone(),
            config.accuracy.clone(),
            registry,
            cache,
        )
    }

    /// Parse a caller-supplied task type name.
    pub fn parse_task_type(raw: &str) -> RouterResult<TaskType> {
        raw.parse::<TaskType>().map_err(RouterError::from)
    }

    pub fn registry(&self) -> &SharedModelRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &SharedCacheAside {
        &self.cache
    }

    pub fn floors(&self) -> &AccuracyFloors {
        &self.floors
    }

    /// Cache key of `task` at `tier`.
    pub fn cache_key(&self, task: &Task, tier: ModelTier) -> CacheKey {
        if task.task_type() == TaskType::Search {
            CacheKey::for_search(self.cache.namespace(), task.org_id(), task.content_hash())
        } else {
            CacheKey::new(
                self.cache.namespace(),
                task.org_id(),
                task.doc_id(),
                &task.input_hash(),
                task.task_type(),
                Some(tier),
            )
        }
    }

    /// Route one task.
    pub async fn select(&self, task: &Task) -> RouterResult<RoutingDecision> {
        if task.content().trim().is_empty() {
            return Err(RouterError::EmptyInput {
                task_type: task.task_type(),
                doc_id: task.doc_id().to_string(),
            });
        }

        let mut trace = DecisionTrace::new();

        let assessment = self.assessor.assess(task.content(), task.task_type());
        trace.push(TraceStep::Assessed {
            class: assessment.class,
            score: assessment.score,
            rationale: assessment.rationale.clone(),
        });

        let (candidate, reason) = candidate_tier(assessment.class, task.weights(), &self.config);
        trace.push(TraceStep::CandidateTier {
            tier: candidate,
            reason: reason.to_string(),
        });

        let floor = self.floors.floor_for(task.task_type());
        let cache_key = self.cache_key(task, candidate);
        let cached = self.cache.lookup(&cache_key).await;
        trace.push(TraceStep::CacheChecked {
            key: cache_key.render(),
            hit: cached.is_some(),
        });

        let mut decision = RoutingDecision {
            task_id: task.id().to_string(),
            task_type: task.task_type(),
            candidate_tier: candidate,
            tier: candidate,
            model: None,
            accuracy_floor: floor,
            complexity: assessment.class,
            cache_hit: false,
            cached_value: None,
            cache_key,
            trace: DecisionTrace::new(),
        };

        if let Some(entry) = cached {
            decision.cache_hit = true;
            decision.cached_value = Some(entry.value);
            decision.trace = trace;
            debug!(task_id = task.id(), task_type = %task.task_type(), "router: cache hit");
            return Ok(decision);
        }

        if !task.task_type().requires_model() {
            trace.push(TraceStep::NoModelRequired);
            decision.trace = trace;
            return Ok(decision);
        }

        let (tier, models) = self
            .registry
            .resolve(candidate, floor, Some(task.weights()))
            .map_err(|e| match e {
                RegistryError::Exhausted { .. } => RouterError::RegistryExhausted {
                    tier: candidate,
                    floor,
                },
                other => RouterError::InvalidTask(other.to_string()),
            })?;

        if tier != candidate {
            trace.push(TraceStep::TierEscalated {
                from: candidate,
                to: tier,
                floor,
            });
        }
        // `resolve` only returns tiers with at least one model.
        let model = models
            .first()
            .map(|m| m.name.clone())
            .ok_or(RouterError::RegistryExhausted { tier, floor })?;
        trace.push(TraceStep::ModelSelected {
            model: model.clone(),
            tier,
            alternatives: models.len().saturating_sub(1),
        });

        decision.tier = tier;
        decision.model = Some(model);
        decision.trace = trace;

        info!(
            task_id = task.id(),
            task_type = %task.task_type(),
            tier = %decision.tier,
            model = decision.model.as_deref().unwrap_or("-"),
            complexity = %decision.complexity,
            "router: routed"
        );
        Ok(decision)
    }
}
