//! Per-task dispatch state machine
//!
//! All retry, fallback and escalation policy lives in one transition
//! function, [`DispatchMachine::step`]. It never touches a clock, a backend
//! or the registry: the driver feeds it events plus the time left before the
//! caller deadline, and executes the command it returns. Tests drive it with
//! synthetic events.
//!
//! ```text
//! Submitted → Routed ─┬─► CacheHit ──────────────────────────► Completed(ok)
//!                     └─► Dispatched ─┬─► Succeeded ─────────► Completed(ok)
//!                          ▲          ├─► Retrying ──┐
//!                          ├──────────┼──────────────┘
//!                          │          ├─► FallbackModel ─┐
//!                          ├──────────┼──────────────────┘
//!                          │          ├─► TierEscalated ─► (resolve tier)
//!                          └──────────┘
//!                                     └─► Failed ────────────► Completed(err)
//! ```

use super::errors::DispatchError;
use crate::config::RetryConfig;
use crate::registry::{AccuracyClass, ModelTier};
use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of one task's dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Submitted,
    Routed,
    CacheHit,
    Dispatched,
    Retrying,
    FallbackModel,
    TierEscalated,
    Succeeded,
    Failed,
    Completed,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Routed => "routed",
            Self::CacheHit => "cache_hit",
            Self::Dispatched => "dispatched",
            Self::Retrying => "retrying",
            Self::FallbackModel => "fallback_model",
            Self::TierEscalated => "tier_escalated",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Start { cache_hit: bool },
    /// Registry returned available models (preference order) for a tier
    TierResolved { tier: ModelTier, models: Vec<String> },
    /// Registry had nothing at or above the requested tier
    TierUnavailable { tier: ModelTier },
    CallSucceeded,
    CallRateLimited,
    CallTimedOut,
    CallServerError { reason: String },
    CallRejected { reason: String },
    /// The model's circuit refused admission; no call was made
    ModelUnavailable,
    WaitElapsed,
    DeadlineElapsed,
}

impl std::fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start { .. } => write!(f, "start"),
            Self::TierResolved { tier, .. } => write!(f, "tier_resolved({})", tier),
            Self::TierUnavailable { tier } => write!(f, "tier_unavailable({})", tier),
            Self::CallSucceeded => write!(f, "call_succeeded"),
            Self::CallRateLimited => write!(f, "call_rate_limited"),
            Self::CallTimedOut => write!(f, "call_timed_out"),
            Self::CallServerError { .. } => write!(f, "call_server_error"),
            Self::CallRejected { .. } => write!(f, "call_rejected"),
            Self::ModelUnavailable => write!(f, "model_unavailable"),
            Self::WaitElapsed => write!(f, "wait_elapsed"),
            Self::DeadlineElapsed => write!(f, "deadline_elapsed"),
        }
    }
}

/// How a dispatch ended
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Serve the value carried by the routing decision
    CacheHit,
    Succeeded { model: String, tier: ModelTier },
    Failed(DispatchError),
}

/// What the driver must do next
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchCommand {
    ResolveTier { tier: ModelTier },
    Invoke {
        model: String,
        tier: ModelTier,
        attempt: u32,
    },
    Wait { delay: Duration },
    Finish(DispatchOutcome),
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: DispatchState,
    pub to: DispatchState,
    pub event: String,
}

/// Retry limits for the model currently being called
#[derive(Debug, Clone, Copy, Default)]
struct ModelCounters {
    rate_limited: u32,
    timed_out: u32,
    server_errors: u32,
}

/// State of one task's dispatch
#[derive(Debug, Clone)]
pub struct DispatchMachine {
    task_id: TaskId,
    backoff: Vec<Duration>,
    timeout_retries: u32,
    server_error_retries: u32,
    state: DispatchState,
    tier: ModelTier,
    floor: AccuracyClass,
    /// Router's chosen model, tried first in the initial tier
    preferred: Option<String>,
    models: Vec<String>,
    index: usize,
    counters: ModelCounters,
    attempts: u32,
    last_error: Option<DispatchError>,
    history: Vec<Transition>,
}

impl DispatchMachine {
    pub fn new(
        task_id: impl Into<TaskId>,
        tier: ModelTier,
        preferred: Option<String>,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            backoff: retry.rate_limit_backoff(),
            timeout_retries: retry.timeout_retries,
            server_error_retries: retry.server_error_retries,
            state: DispatchState::Submitted,
            tier,
            floor: AccuracyClass::Basic,
            preferred,
            models: Vec::new(),
            index: 0,
            counters: ModelCounters::default(),
            attempts: 0,
            last_error: None,
            history: Vec::new(),
        }
    }

    /// Accuracy floor reported when no model can be found.
    pub fn with_accuracy_floor(mut self, floor: AccuracyClass) -> Self {
        self.floor = floor;
        self
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn tier(&self) -> ModelTier {
        self.tier
    }

    /// Model currently (or last) being called.
    pub fn current_model(&self) -> Option<&str> {
        self.models.get(self.index).map(String::as_str)
    }

    /// Backend invocations issued so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn into_history(self) -> Vec<Transition> {
        self.history
    }

    /// Advance on `event`, given the time left before the caller deadline.
    pub fn step(&mut self, event: DispatchEvent, remaining: Duration) -> DispatchCommand {
        use DispatchState as S;

        let label = event.to_string();
        if self.state.is_terminal() {
            return self.reject_event(&label);
        }

        match (self.state, event) {
            (S::Submitted, DispatchEvent::Start { cache_hit: true }) => {
                self.enter(S::Routed, &label);
                self.enter(S::CacheHit, &label);
                self.finish(DispatchOutcome::CacheHit, &label)
            }
            (S::Submitted, DispatchEvent::Start { cache_hit: false }) => {
                self.enter(S::Routed, &label);
                DispatchCommand::ResolveTier { tier: self.tier }
            }
            (S::Routed | S::TierEscalated, DispatchEvent::TierResolved { tier, models }) => {
                if models.is_empty() {
                    return self.exhausted(tier, &label);
                }
                self.tier = tier;
                self.models = models;
                if let Some(preferred) = self.preferred.take() {
                    if let Some(pos) = self.models.iter().position(|m| *m == preferred) {
                        let model = self.models.remove(pos);
                        self.models.insert(0, model);
                    }
                }
                self.index = 0;
                self.counters = ModelCounters::default();
                self.invoke(&label, remaining)
            }
            (S::Routed | S::TierEscalated, DispatchEvent::TierUnavailable { tier }) => {
                self.exhausted(tier, &label)
            }
            (S::Dispatched, DispatchEvent::CallSucceeded) => {
                let model = self.current_model().unwrap_or_default().to_string();
                self.enter(S::Succeeded, &label);
                self.finish(
                    DispatchOutcome::Succeeded {
                        model,
                        tier: self.tier,
                    },
                    &label,
                )
            }
            (S::Dispatched, DispatchEvent::CallRateLimited) => {
                self.counters.rate_limited += 1;
                self.last_error = Some(DispatchError::RateLimited {
                    model: self.current_model().unwrap_or_default().to_string(),
                });
                let slot = self.counters.rate_limited as usize - 1;
                match self.backoff.get(slot).copied() {
                    // A wait that would outlive the deadline goes straight to fallback.
                    Some(delay) if delay < remaining => {
                        self.enter(S::Retrying, &label);
                        DispatchCommand::Wait { delay }
                    }
                    _ => self.fallback(&label, remaining),
                }
            }
            (S::Dispatched, DispatchEvent::CallTimedOut) => {
                self.counters.timed_out += 1;
                self.last_error = Some(DispatchError::Timeout {
                    task_id: self.task_id.clone(),
                    model: self.current_model().map(str::to_string),
                });
                if self.counters.timed_out <= self.timeout_retries {
                    self.enter(S::Retrying, &label);
                    self.invoke(&label, remaining)
                } else {
                    self.fallback(&label, remaining)
                }
            }
            (S::Dispatched, DispatchEvent::CallServerError { reason }) => {
                self.counters.server_errors += 1;
                self.last_error = Some(DispatchError::ModelError {
                    model: self.current_model().unwrap_or_default().to_string(),
                    reason,
                });
                if self.counters.server_errors <= self.server_error_retries {
                    self.enter(S::Retrying, &label);
                    self.invoke(&label, remaining)
                } else {
                    self.fallback(&label, remaining)
                }
            }
            (S::Dispatched, DispatchEvent::CallRejected { reason }) => {
                let err = DispatchError::ModelError {
                    model: self.current_model().unwrap_or_default().to_string(),
                    reason,
                };
                self.fail(err, &label)
            }
            (S::Dispatched, DispatchEvent::ModelUnavailable) => {
                // The invocation never reached the backend.
                self.attempts = self.attempts.saturating_sub(1);
                self.fallback(&label, remaining)
            }
            (S::Retrying, DispatchEvent::WaitElapsed) => self.invoke(&label, remaining),
            (_, DispatchEvent::DeadlineElapsed) => self.deadline(&label),
            _ => self.reject_event(&label),
        }
    }

    fn enter(&mut self, to: DispatchState, event: &str) {
        self.history.push(Transition {
            from: self.state,
            to,
            event: event.to_string(),
        });
        self.state = to;
    }

    fn finish(&mut self, outcome: DispatchOutcome, event: &str) -> DispatchCommand {
        self.enter(DispatchState::Completed, event);
        DispatchCommand::Finish(outcome)
    }

    fn fail(&mut self, err: DispatchError, event: &str) -> DispatchCommand {
        self.enter(DispatchState::Failed, event);
        self.finish(DispatchOutcome::Failed(err), event)
    }

    fn deadline(&mut self, event: &str) -> DispatchCommand {
        let err = DispatchError::Timeout {
            task_id: self.task_id.clone(),
            model: self.current_model().map(str::to_string),
        };
        self.fail(err, event)
    }

    /// Call the current model, unless the deadline already passed.
    fn invoke(&mut self, event: &str, remaining: Duration) -> DispatchCommand {
        if remaining.is_zero() {
            return self.deadline(event);
        }
        let Some(model) = self.current_model().map(str::to_string) else {
            return self.exhausted(self.tier, event);
        };
        self.enter(DispatchState::Dispatched, event);
        self.attempts += 1;
        DispatchCommand::Invoke {
            model,
            tier: self.tier,
            attempt: self.attempts,
        }
    }

    /// Next model in the tier, else the next tier up, else give up.
    fn fallback(&mut self, event: &str, remaining: Duration) -> DispatchCommand {
        if self.index + 1 < self.models.len() {
            self.index += 1;
            self.counters = ModelCounters::default();
            self.enter(DispatchState::FallbackModel, event);
            return self.invoke(event, remaining);
        }
        match self.tier.next_up() {
            Some(next) if !remaining.is_zero() => {
                self.enter(DispatchState::TierEscalated, event);
                DispatchCommand::ResolveTier { tier: next }
            }
            Some(_) => self.deadline(event),
            None => self.exhausted(self.tier, event),
        }
    }

    fn exhausted(&mut self, tier: ModelTier, event: &str) -> DispatchCommand {
        let last = self.last_error.take().unwrap_or(DispatchError::NoModelAvailable {
            tier,
            floor: self.floor,
        });
        let err = DispatchError::TaskFailed {
            task_id: self.task_id.clone(),
            attempts: self.attempts,
            last: Box::new(last),
        };
        self.fail(err, event)
    }

    /// An event that makes no sense in the current state ends the task.
    fn reject_event(&mut self, event: &str) -> DispatchCommand {
        let err = DispatchError::InvalidDecision {
            reason: format!("event {} not valid in state {}", event, self.state),
        };
        if self.state.is_terminal() {
            return DispatchCommand::Finish(DispatchOutcome::Failed(err));
        }
        self.fail(err, event)
    }
}
