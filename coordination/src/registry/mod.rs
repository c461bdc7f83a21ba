//! Model Registry — backend catalog and live health
//!
//! Holds the cost/latency/accuracy profile of every backend model, grouped
//! into tiers, together with each model's circuit. Lookups return the
//! available models of a tier in preference order; `escalate` walks the
//! tier ladder upward when a tier has nothing usable.
//!
//! ```text
//! fast_cheap ──► balanced ──► premium ──► RegistryError::Exhausted
//! ```

use crate::router::circuit_breaker::{CircuitClock, CircuitPermit, CircuitState, ModelCircuit};
use crate::task::PriorityWeights;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cost/latency/accuracy class of backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Small, cheap, fast models
    FastCheap,
    /// Mid-size general models
    Balanced,
    /// Largest, most accurate models
    Premium,
}

impl ModelTier {
    /// Tiers from cheapest to most capable.
    pub fn ladder() -> &'static [ModelTier] {
        &[ModelTier::FastCheap, ModelTier::Balanced, ModelTier::Premium]
    }

    /// Next tier up, `None` at the top.
    pub fn next_up(&self) -> Option<Self> {
        match self {
            Self::FastCheap => Some(Self::Balanced),
            Self::Balanced => Some(Self::Premium),
            Self::Premium => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastCheap => "fast_cheap",
            Self::Balanced => "balanced",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Expected output quality of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyClass {
    Basic,
    Standard,
    High,
}

impl std::fmt::Display for AccuracyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Standard => write!(f, "standard"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Static profile of one backend model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Name passed to the backend
    pub name: String,
    pub tier: ModelTier,
    /// Cost per 1k tokens
    pub cost_per_unit: f64,
    /// Typical end-to-end latency
    pub expected_latency_ms: u64,
    pub accuracy: AccuracyClass,
}

impl ModelProfile {
    pub fn new(
        name: impl Into<String>,
        tier: ModelTier,
        cost_per_unit: f64,
        expected_latency_ms: u64,
        accuracy: AccuracyClass,
    ) -> Self {
        Self {
            name: name.into(),
            tier,
            cost_per_unit,
            expected_latency_ms,
            accuracy,
        }
    }

    /// Catalog used when the config does not name any models.
    pub fn default_catalog() -> Vec<ModelProfile> {
        vec![
            Self::new(
                "llama-3.1-8b-instruct",
                ModelTier::FastCheap,
                0.05,
                900,
                AccuracyClass::Basic,
            ),
            Self::new(
                "mistral-small-instruct",
                ModelTier::FastCheap,
                0.10,
                700,
                AccuracyClass::Basic,
            ),
            Self::new(
                "qwen2.5-32b-instruct",
                ModelTier::Balanced,
                0.40,
                2_500,
                AccuracyClass::Standard,
            ),
            Self::new(
                "llama-3.1-70b-instruct",
                ModelTier::Balanced,
                0.60,
                3_500,
                AccuracyClass::Standard,
            ),
            Self::new(
                "llama-3.1-405b-instruct",
                ModelTier::Premium,
                2.50,
                9_000,
                AccuracyClass::High,
            ),
        ]
    }

    /// Cost of one call producing up to `max_tokens`.
    pub fn call_cost(&self, max_tokens: u32) -> f64 {
        self.cost_per_unit * f64::from(max_tokens) / 1000.0
    }
}

/// Errors raised by registry lookups
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("No available model at or above tier {from} meeting accuracy floor {floor}")]
    Exhausted { from: ModelTier, floor: AccuracyClass },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Invalid model catalog: {0}")]
    InvalidCatalog(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Point-in-time health of one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHealth {
    pub name: String,
    pub tier: ModelTier,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

struct ModelEntry {
    profile: ModelProfile,
    circuit: ModelCircuit,
}

/// Shared reference to ModelRegistry
pub type SharedModelRegistry = Arc<ModelRegistry>;

/// Catalog of backend models with lock-free health state.
///
/// The catalog is fixed at construction; only the circuits change, so the
/// registry can be shared behind a plain `Arc` without any lock.
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
    by_name: HashMap<String, usize>,
    clock: CircuitClock,
}

impl ModelRegistry {
    /// Build a registry from a catalog and circuit parameters.
    ///
    /// The catalog must be non-empty and model names unique.
    pub fn new(
        models: Vec<ModelProfile>,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> RegistryResult<Self> {
        if models.is_empty() {
            return Err(RegistryError::InvalidCatalog("catalog is empty".into()));
        }
        let mut by_name = HashMap::with_capacity(models.len());
        let mut entries = Vec::with_capacity(models.len());
        for (idx, profile) in models.into_iter().enumerate() {
            if by_name.insert(profile.name.clone(), idx).is_some() {
                return Err(RegistryError::InvalidCatalog(format!(
                    "duplicate model name {}",
                    profile.name
                )));
            }
            entries.push(ModelEntry {
                profile,
                circuit: ModelCircuit::new(failure_threshold, cooldown),
            });
        }
        Ok(Self {
            entries,
            by_name,
            clock: CircuitClock::new(),
        })
    }

    /// Build from the registry section of the layer config.
    pub fn from_config(config: &crate::config::RegistryConfig) -> RegistryResult<Self> {
        Self::new(
            config.models.clone(),
            config.failure_threshold,
            config.cooldown(),
        )
    }

    /// Create a shared reference to this registry
    pub fn shared(self) -> SharedModelRegistry {
        Arc::new(self)
    }

    /// Available models of `tier`, cheapest first.
    pub fn lookup(&self, tier: ModelTier) -> Vec<ModelProfile> {
        self.lookup_for(tier, AccuracyClass::Basic, None)
    }

    /// Available models of `tier` meeting `floor`, in preference order.
    ///
    /// Cost ascending by default; when the caller weights speed over cost,
    /// expected latency comes first. Name breaks remaining ties.
    pub fn lookup_for(
        &self,
        tier: ModelTier,
        floor: AccuracyClass,
        weights: Option<&PriorityWeights>,
    ) -> Vec<ModelProfile> {
        let now = self.clock.now_ms();
        let mut models: Vec<&ModelProfile> = self
            .entries
            .iter()
            .filter(|e| e.profile.tier == tier)
            .filter(|e| e.profile.accuracy >= floor)
            .filter(|e| e.circuit.is_available(now))
            .map(|e| &e.profile)
            .collect();

        let latency_first = weights.map(|w| w.prefers_latency()).unwrap_or(false);
        models.sort_by(|a, b| {
            let by_cost = a.cost_per_unit.total_cmp(&b.cost_per_unit);
            let by_latency = a.expected_latency_ms.cmp(&b.expected_latency_ms);
            let primary = if latency_first {
                by_latency.then(by_cost)
            } else {
                by_cost.then(by_latency)
            };
            primary.then_with(|| a.name.cmp(&b.name))
        });

        models.into_iter().cloned().collect()
    }

    /// Next tier above `tier`.
    pub fn escalate(&self, tier: ModelTier, floor: AccuracyClass) -> RegistryResult<ModelTier> {
        tier.next_up()
            .ok_or(RegistryError::Exhausted { from: tier, floor })
    }

    /// First tier at or above `tier` with an available model meeting
    /// `floor`, together with its models in preference order.
    pub fn resolve(
        &self,
        tier: ModelTier,
        floor: AccuracyClass,
        weights: Option<&PriorityWeights>,
    ) -> RegistryResult<(ModelTier, Vec<ModelProfile>)> {
        let mut current = tier;
        loop {
            let models = self.lookup_for(current, floor, weights);
            if !models.is_empty() {
                return Ok((current, models));
            }
            debug!(tier = %current, floor = %floor, "registry: no available model in tier");
            current = self
                .escalate(current, floor)
                .map_err(|_| RegistryError::Exhausted { from: tier, floor })?;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelProfile> {
        self.by_name.get(name).map(|&idx| &self.entries[idx].profile)
    }

    fn entry(&self, name: &str) -> RegistryResult<&ModelEntry> {
        self.by_name
            .get(name)
            .map(|&idx| &self.entries[idx])
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.entry(name)
            .map(|e| e.circuit.is_available(self.clock.now_ms()))
            .unwrap_or(false)
    }

    /// Admit one call to `name`, or `None` while its circuit is open or
    /// its half-open probe is already taken.
    pub fn try_acquire(&self, name: &str) -> Option<CircuitPermit<'_>> {
        let entry = self.entry(name).ok()?;
        let permit = entry.circuit.try_acquire(self.clock.now_ms())?;
        if permit.is_probe() {
            debug!(model = name, "registry: half-open probe admitted");
        }
        Some(permit)
    }

    pub fn record_success(&self, name: &str) -> RegistryResult<()> {
        let entry = self.entry(name)?;
        if entry.circuit.failure_count() > 0 {
            info!(model = name, "registry: model recovered, circuit closed");
        }
        entry.circuit.record_success();
        Ok(())
    }

    pub fn record_failure(&self, name: &str) -> RegistryResult<()> {
        let entry = self.entry(name)?;
        if entry.circuit.record_failure(self.clock.now_ms()) {
            warn!(
                model = name,
                failures = entry.circuit.failure_count(),
                "registry: circuit opened"
            );
        }
        Ok(())
    }

    /// Health of every model, in catalog order.
    pub fn health_snapshot(&self) -> Vec<ModelHealth> {
        let now = self.clock.now_ms();
        self.entries
            .iter()
            .map(|e| ModelHealth {
                name: e.profile.name.clone(),
                tier: e.profile.tier,
                state: e.circuit.state(now),
                consecutive_failures: e.circuit.failure_count(),
            })
            .collect()
    }

    /// All profiles, in catalog order.
    pub fn catalog(&self) -> Vec<ModelProfile> {
        self.entries.iter().map(|e| e.profile.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32) -> ModelRegistry {
        ModelRegistry::new(
            ModelProfile::default_catalog(),
            threshold,
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_orders_by_cost() {
        let names: Vec<String> = registry(3)
            .lookup(ModelTier::FastCheap)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["llama-3.1-8b-instruct", "mistral-small-instruct"]);
    }

    #[test]
    fn test_lookup_prefers_latency_when_speed_dominates() {
        let weights = PriorityWeights::new(0.1, 0.8, 0.1).unwrap();
        let models = registry(3).lookup_for(
            ModelTier::FastCheap,
            AccuracyClass::Basic,
            Some(&weights),
        );
        assert_eq!(models[0].name, "mistral-small-instruct");
    }

    #[test]
    fn test_accuracy_floor_filters_models() {
        let reg = registry(3);
        assert!(reg
            .lookup_for(ModelTier::FastCheap, AccuracyClass::Standard, None)
            .is_empty());
        assert_eq!(
            reg.lookup_for(ModelTier::Balanced, AccuracyClass::Standard, None)
                .len(),
            2
        );
    }

    #[test]
    fn test_open_circuit_hides_model() {
        let reg = registry(1);
        reg.record_failure("llama-3.1-8b-instruct").unwrap();
        assert!(!reg.is_available("llama-3.1-8b-instruct"));
        let names: Vec<String> = reg
            .lookup(ModelTier::FastCheap)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["mistral-small-instruct"]);

        reg.record_success("llama-3.1-8b-instruct").unwrap();
        assert!(reg.is_available("llama-3.1-8b-instruct"));
    }

    #[test]
    fn test_resolve_escalates_to_next_tier() {
        let reg = registry(1);
        reg.record_failure("llama-3.1-8b-instruct").unwrap();
        reg.record_failure("mistral-small-instruct").unwrap();

        let (tier, models) = reg
            .resolve(ModelTier::FastCheap, AccuracyClass::Basic, None)
            .unwrap();
        assert_eq!(tier, ModelTier::Balanced);
        assert_eq!(models[0].name, "qwen2.5-32b-instruct");
    }

    #[test]
    fn test_resolve_exhausted_at_top() {
        let reg = registry(1);
        reg.record_failure("llama-3.1-405b-instruct").unwrap();
        let err = reg
            .resolve(ModelTier::Premium, AccuracyClass::Basic, None)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Exhausted {
                from: ModelTier::Premium,
                floor: AccuracyClass::Basic
            }
        );
        assert!(reg.escalate(ModelTier::Premium, AccuracyClass::Basic).is_err());
    }

    #[test]
    fn test_unknown_model_is_an_error() {
        let reg = registry(3);
        assert_eq!(
            reg.record_failure("gpt-unknown"),
            Err(RegistryError::UnknownModel("gpt-unknown".to_string()))
        );
    }

    #[test]
    fn test_invalid_catalog_rejected() {
        assert!(matches!(
            ModelRegistry::new(Vec::new(), 3, Duration::from_secs(1)),
            Err(RegistryError::InvalidCatalog(_))
        ));
        let mut models = ModelProfile::default_catalog();
        models.push(models[0].clone());
        assert!(matches!(
            ModelRegistry::new(models, 3, Duration::from_secs(1)),
            Err(RegistryError::InvalidCatalog(_))
        ));
    }

    #[test]
    fn test_health_snapshot_reports_state() {
        let reg = registry(2);
        reg.record_failure("qwen2.5-32b-instruct").unwrap();
        reg.record_failure("qwen2.5-32b-instruct").unwrap();
        let snapshot = reg.health_snapshot();
        let qwen = snapshot
            .iter()
            .find(|h| h.name == "qwen2.5-32b-instruct")
            .unwrap();
        assert_eq!(qwen.state, CircuitState::Open);
        assert_eq!(qwen.consecutive_failures, 2);
    }
}
