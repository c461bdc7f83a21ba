//! Backend collaborator seam
//!
//! [`Backend`] is the only way the layer talks to a model. Production code
//! plugs in a network client; tests plug in [`ScriptedBackend`], which
//! replays per-model scripts of synthetic responses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Failures a backend call can report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BackendError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Backend timed out: {0}")]
    Timeout(String),

    /// 5xx-equivalent failure
    #[error("Backend server error: {0}")]
    Server(String),

    /// The request itself was refused (bad prompt, unknown model, ...)
    #[error("Backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Whether retrying the same request can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// `CallBackend(model_name, prompt, max_tokens) -> text`
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(&self, model: &str, prompt: &str, max_tokens: u32) -> Result<String, BackendError>;
}

/// Shared reference to a backend
pub type SharedBackend = Arc<dyn Backend>;

/// One scripted response
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Reply(String),
    Fail(BackendError),
    /// Sleep, then reply. Used to exceed timeouts.
    Hang(Duration),
}

/// A recorded call against a [`ScriptedBackend`]
#[derive(Debug, Clone)]
pub struct BackendCall {
    pub model: String,
    pub max_tokens: u32,
    pub prompt_chars: usize,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct ScriptState {
    queued: HashMap<String, VecDeque<ScriptStep>>,
    repeat: HashMap<String, ScriptStep>,
    calls: Vec<BackendCall>,
}

/// Deterministic fake backend driven by per-model scripts.
///
/// Each call pops the model's next queued step. Once the queue is empty the
/// model's `always` step repeats; without one the call replies
/// `"{model}: ok"`.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
    latency: Duration,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before acting on the script.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue steps for `model`.
    pub fn script(self, model: &str, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        self.lock()
            .queued
            .entry(model.to_string())
            .or_default()
            .extend(steps);
        self
    }

    /// Repeat `step` for `model` once its queue is drained.
    pub fn always(self, model: &str, step: ScriptStep) -> Self {
        self.lock().repeat.insert(model.to_string(), step);
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, model: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.model == model).count()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    fn next_step(&self, model: &str, prompt: &str, max_tokens: u32) -> ScriptStep {
        let mut state = self.lock();
        state.calls.push(BackendCall {
            model: model.to_string(),
            max_tokens,
            prompt_chars: prompt.chars().count(),
            at: Instant::now(),
        });
        if let Some(step) = state.queued.get_mut(model).and_then(|q| q.pop_front()) {
            return step;
        }
        state
            .repeat
            .get(model)
            .cloned()
            .unwrap_or_else(|| ScriptStep::Reply(format!("{}: ok", model)))
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn call(&self, model: &str, prompt: &str, max_tokens: u32) -> Result<String, BackendError> {
        let step = self.next_step(model, prompt, max_tokens);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match step {
            ScriptStep::Reply(text) => Ok(text),
            ScriptStep::Fail(err) => Err(err),
            ScriptStep::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(format!("{}: late", model))
            }
        }
    }
}
