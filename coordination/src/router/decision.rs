//! Routing decisions and their trace
//!
//! A [`RoutingDecision`] is plain data: it can be logged, serialized and
//! fed back into the dispatcher to replay a task.

use super::classifier::ComplexityClass;
use crate::cache::CacheKey;
use crate::registry::{AccuracyClass, ModelTier};
use crate::task::{TaskId, TaskType};
use serde::{Deserialize, Serialize};

/// One step of the router's reasoning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TraceStep {
    Assessed {
        class: ComplexityClass,
        score: u8,
        rationale: String,
    },
    CandidateTier {
        tier: ModelTier,
        reason: String,
    },
    CacheChecked {
        key: String,
        hit: bool,
    },
    TierEscalated {
        from: ModelTier,
        to: ModelTier,
        floor: AccuracyClass,
    },
    ModelSelected {
        model: String,
        tier: ModelTier,
        alternatives: usize,
    },
    /// Served without a backend model (search merges)
    NoModelRequired,
}

impl std::fmt::Display for TraceStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assessed { class, score, .. } => write!(f, "assessed({}/5 {})", score, class),
            Self::CandidateTier { tier, reason } => write!(f, "candidate({} : {})", tier, reason),
            Self::CacheChecked { hit, .. } => {
                write!(f, "cache({})", if *hit { "hit" } else { "miss" })
            }
            Self::TierEscalated { from, to, floor } => {
                write!(f, "escalated({} → {} floor={})", from, to, floor)
            }
            Self::ModelSelected { model, tier, .. } => write!(f, "model({}@{})", model, tier),
            Self::NoModelRequired => write!(f, "no_model"),
        }
    }
}

/// Ordered record of how a decision was reached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    steps: Vec<TraceStep>,
}

impl DecisionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: TraceStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    /// Whether the candidate tier was abandoned for a higher one.
    pub fn escalated(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, TraceStep::TierEscalated { .. }))
    }

    /// Get a compact summary for logging
    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

/// Result of routing one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_id: TaskId,
    pub task_type: TaskType,
    /// Tier picked from complexity and weights, before any escalation
    pub candidate_tier: ModelTier,
    /// Tier the task will run at
    pub tier: ModelTier,
    /// Model to call first, `None` on a cache hit or for search
    pub model: Option<String>,
    /// Minimum accuracy any model serving this task must meet
    pub accuracy_floor: AccuracyClass,
    pub complexity: ComplexityClass,
    pub cache_hit: bool,
    /// Cached result when `cache_hit` is set
    pub cached_value: Option<serde_json::Value>,
    /// Key the result is cached under (derived from the candidate tier)
    pub cache_key: CacheKey,
    pub trace: DecisionTrace,
}

impl RoutingDecision {
    /// Get a compact summary for logging
    pub fn summary(&self) -> String {
        format!(
            "task={} type={} tier={} model={} cache_hit={} trace=[{}]",
            self.task_id,
            self.task_type,
            self.tier,
            self.model.as_deref().unwrap_or("-"),
            self.cache_hit,
            self.trace.summary()
        )
    }
}
