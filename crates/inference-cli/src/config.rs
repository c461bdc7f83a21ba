use anyhow::{Context, Result};
use inference_coordination::CoreConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Driver configuration: where the backend and documents live.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// OpenAI-compatible base URL, e.g. `http://localhost:8000/v1`
    pub backend_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    /// Outer bound on one HTTP request; the dispatcher's tier timeouts are tighter.
    pub http_timeout: Duration,
    /// Root of `{org}/{doc}.txt` files
    pub documents_root: PathBuf,
    /// Optional TOML file for the coordination layer
    pub core_config: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl CliConfig {
    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            backend_url: lookup("INFERENCE_BACKEND_URL")
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            api_key_env: lookup("INFERENCE_API_KEY_ENV")
                .unwrap_or_else(|| "INFERENCE_API_KEY".to_string()),
            http_timeout: Duration::from_secs(
                lookup("INFERENCE_HTTP_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(120),
            ),
            documents_root: lookup("INFERENCE_DOCUMENTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./documents")),
            core_config: lookup("INFERENCE_CONFIG").map(PathBuf::from),
        }
    }

    /// API key from the configured variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    /// Core config from the TOML file when one is set, else defaults plus env.
    pub fn load_core(&self) -> Result<CoreConfig> {
        match &self.core_config {
            Some(path) => CoreConfig::load(path)
                .with_context(|| format!("Failed to load core config {}", path.display())),
            None => CoreConfig::from_env().context("Invalid core config in environment"),
        }
    }
}
