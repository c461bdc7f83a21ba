//! Layer configuration
//!
//! Every knob has a built-in default. A TOML file can override any subset
//! of them, and `INFERENCE_*` environment variables override the file.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `INFERENCE_PREMIUM_ACCURACY_WEIGHT` | `0.6` | Accuracy weight above which premium is chosen |
//! | `INFERENCE_CHEAP_COST_WEIGHT` | `0.6` | Cost weight at or above which simple tasks go fast_cheap |
//! | `INFERENCE_TIMEOUT_RETRIES` | `1` | Same-model retries after a timeout |
//! | `INFERENCE_CACHE_DURABLE_TTL_SECS` | `86400` | TTL for AI outputs |
//! | `INFERENCE_CACHE_EPHEMERAL_TTL_SECS` | `300` | TTL for search merges |
//! | `INFERENCE_CACHE_NAMESPACE` | `ilr` | Prefix of every cache key |
//! | `INFERENCE_CIRCUIT_FAILURE_THRESHOLD` | `3` | Consecutive failures before a circuit opens |
//! | `INFERENCE_CIRCUIT_COOLDOWN_SECS` | `60` | Seconds before an open circuit half-opens |
//! | `INFERENCE_RRF_K` | `60` | Reciprocal rank fusion smoothing constant |

use crate::registry::{AccuracyClass, ModelProfile, ModelTier};
use crate::task::TaskType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Thresholds that map caller weights to a candidate tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Accuracy weight strictly above this selects premium
    pub premium_accuracy_weight: f64,
    /// Cost weight at or above this sends simple tasks to fast_cheap
    pub cheap_cost_weight: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            premium_accuracy_weight: 0.6,
            cheap_cost_weight: 0.6,
        }
    }
}

/// Minimum model accuracy per task type.
///
/// Task types with a floor above `basic` are accuracy-flagged: the router
/// only ever escalates them upward, never to a cheaper tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccuracyFloors {
    pub floors: BTreeMap<TaskType, AccuracyClass>,
}

impl AccuracyFloors {
    pub fn floor_for(&self, task_type: TaskType) -> AccuracyClass {
        self.floors
            .get(&task_type)
            .copied()
            .unwrap_or(AccuracyClass::Basic)
    }

    pub fn is_accuracy_flagged(&self, task_type: TaskType) -> bool {
        self.floor_for(task_type) > AccuracyClass::Basic
    }
}

impl Default for AccuracyFloors {
    fn default() -> Self {
        let mut floors = BTreeMap::new();
        floors.insert(TaskType::Risk, AccuracyClass::Standard);
        floors.insert(TaskType::Qa, AccuracyClass::Standard);
        Self { floors }
    }
}

/// Retry schedule for transient backend failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delays before each same-model retry after a rate limit
    pub rate_limit_backoff_ms: Vec<u64>,
    /// Same-model retries after a timeout
    pub timeout_retries: u32,
    /// Same-model retries after a 5xx-equivalent server error
    pub server_error_retries: u32,
}

impl RetryConfig {
    pub fn rate_limit_backoff(&self) -> Vec<Duration> {
        self.rate_limit_backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_backoff_ms: vec![1_000, 4_000, 16_000],
            timeout_retries: 1,
            server_error_retries: 1,
        }
    }
}

/// Per-attempt backend timeout by tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTimeouts {
    pub fast_cheap_secs: u64,
    pub balanced_secs: u64,
    pub premium_secs: u64,
}

impl TierTimeouts {
    pub fn for_tier(&self, tier: ModelTier) -> Duration {
        Duration::from_secs(match tier {
            ModelTier::FastCheap => self.fast_cheap_secs,
            ModelTier::Balanced => self.balanced_secs,
            ModelTier::Premium => self.premium_secs,
        })
    }
}

impl Default for TierTimeouts {
    fn default() -> Self {
        Self {
            fast_cheap_secs: 10,
            balanced_secs: 30,
            premium_secs: 60,
        }
    }
}

/// Cache lifetimes and key namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    /// TTL for durable AI outputs (summary, risk, ...)
    pub durable_ttl_secs: u64,
    /// TTL for ephemeral search-merge results
    pub ephemeral_ttl_secs: u64,
    /// Prefix of every rendered store key
    pub namespace: String,
    /// Upper bound on entries held by the in-memory store (0 = unbounded)
    pub max_entries: usize,
}

impl CacheTtlConfig {
    pub fn ttl_for(&self, task_type: TaskType) -> Duration {
        if task_type.is_ephemeral() {
            Duration::from_secs(self.ephemeral_ttl_secs)
        } else {
            Duration::from_secs(self.durable_ttl_secs)
        }
    }
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            durable_ttl_secs: 86_400,
            ephemeral_ttl_secs: 300,
            namespace: "ilr".to_string(),
            max_entries: 50_000,
        }
    }
}

/// Model catalog and circuit parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Consecutive failures before a model's circuit opens
    pub failure_threshold: u32,
    /// Seconds after opening before the circuit half-opens
    pub cooldown_secs: u64,
    pub models: Vec<ModelProfile>,
}

impl RegistryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
            models: ModelProfile::default_catalog(),
        }
    }
}

/// Reciprocal rank fusion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Smoothing constant k in 1/(k + rank)
    pub k: f64,
    /// Each retriever is asked for `limit * candidate_multiplier` hits
    pub candidate_multiplier: usize,
}

impl FusionConfig {
    pub fn candidate_depth(&self, limit: usize) -> usize {
        limit.saturating_mul(self.candidate_multiplier.max(1))
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k: 60.0,
            candidate_multiplier: 3,
        }
    }
}

/// Content thresholds used by the complexity assessor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessorConfig {
    /// Character count above which length adds one point
    pub medium_length_chars: usize,
    /// Character count above which length adds a second point
    pub long_length_chars: usize,
    /// Structural markers above which structure adds one point
    pub structured_markers: usize,
    /// Structural markers above which structure adds a second point
    pub dense_markers: usize,
}

impl Default for AssessorConfig {
    fn default() -> Self {
        Self {
            medium_length_chars: 4_000,
            long_length_chars: 20_000,
            structured_markers: 10,
            dense_markers: 40,
        }
    }
}

/// Prompt rendering limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Document characters included in a backend prompt
    pub max_content_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_content_chars: 48_000,
        }
    }
}

/// Top-level configuration for the orchestration layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub router: RouterConfig,
    pub accuracy: AccuracyFloors,
    pub retry: RetryConfig,
    pub timeouts: TierTimeouts,
    pub cache: CacheTtlConfig,
    pub registry: RegistryConfig,
    pub fusion: FusionConfig,
    pub assessor: AssessorConfig,
    pub prompt: PromptConfig,
}

impl CoreConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing sections keep their defaults.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `INFERENCE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (the environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        if let Some(v) = parsed(&lookup, "INFERENCE_PREMIUM_ACCURACY_WEIGHT") {
            self.router.premium_accuracy_weight = v;
        }
        if let Some(v) = parsed(&lookup, "INFERENCE_CHEAP_COST_WEIGHT") {
            self.router.cheap_cost_weight = v;
        }
        if let Some(v) = parsed(&lookup, "INFERENCE_TIMEOUT_RETRIES") {
            self.retry.timeout_retries = v;
        }
        if let Some(v) = parsed(&lookup, "INFERENCE_CACHE_DURABLE_TTL_SECS") {
            self.cache.durable_ttl_secs = v;
        }
        if let Some(v) = parsed(&lookup, "INFERENCE_CACHE_EPHEMERAL_TTL_SECS") {
            self.cache.ephemeral_ttl_secs = v;
        }
        if let Some(v) = lookup("INFERENCE_CACHE_NAMESPACE").filter(|s| !s.trim().is_empty()) {
            self.cache.namespace = v.trim().to_string();
        }
        if let Some(v) = parsed(&lookup, "INFERENCE_CIRCUIT_FAILURE_THRESHOLD") {
            self.registry.failure_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "INFERENCE_CIRCUIT_COOLDOWN_SECS") {
            self.registry.cooldown_secs = v;
        }
        if let Some(v) = parsed(&lookup, "INFERENCE_RRF_K") {
            self.fusion.k = v;
        }
    }

    /// Reject malformed values instead of silently correcting them.
    pub fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [
            (
                "router.premium_accuracy_weight",
                self.router.premium_accuracy_weight,
            ),
            ("router.cheap_cost_weight", self.router.cheap_cost_weight),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(invalid(field, format!("{} must be in (0, 1)", value)));
            }
        }

        if !(self.fusion.k.is_finite() && self.fusion.k > 0.0) {
            return Err(invalid("fusion.k", "must be a positive number"));
        }

        for (field, secs) in [
            ("timeouts.fast_cheap_secs", self.timeouts.fast_cheap_secs),
            ("timeouts.balanced_secs", self.timeouts.balanced_secs),
            ("timeouts.premium_secs", self.timeouts.premium_secs),
        ] {
            if secs == 0 {
                return Err(invalid(field, "timeout must be non-zero"));
            }
        }

        if self.cache.namespace.is_empty() || self.cache.namespace.contains(':') {
            return Err(invalid(
                "cache.namespace",
                "must be non-empty and must not contain ':'",
            ));
        }

        if self.registry.failure_threshold == 0 {
            return Err(invalid("registry.failure_threshold", "must be at least 1"));
        }

        if self.registry.models.is_empty() {
            return Err(invalid("registry.models", "catalog is empty"));
        }

        let mut names = std::collections::HashSet::new();
        for model in &self.registry.models {
            if model.name.trim().is_empty() {
                return Err(invalid("registry.models", "model name is empty"));
            }
            if !names.insert(model.name.as_str()) {
                return Err(invalid(
                    "registry.models",
                    format!("duplicate model name {}", model.name),
                ));
            }
            if !(model.cost_per_unit.is_finite() && model.cost_per_unit >= 0.0) {
                return Err(invalid(
                    "registry.models",
                    format!("{} has an invalid cost_per_unit", model.name),
                ));
            }
        }

        Ok(())
    }
}
