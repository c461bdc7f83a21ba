//! Circuit breaker for model health.
//!
//! Each model owns one [`ModelCircuit`]. Consecutive failures past a
//! threshold *open* the circuit and the model is skipped. After a cooldown
//! the circuit reads as *half-open* and one probe is allowed through; a
//! success closes it, a failure re-opens it with a fresh timestamp.
//!
//! The circuit is shared by every in-flight task, so all state lives in
//! atomics. Availability checks on the routing hot path are plain loads;
//! transitions use compare-and-set. Callers take a [`CircuitPermit`] before
//! each call. In half-open only one permit exists at a time, and dropping
//! it frees the probe slot even if the call was cancelled.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state for a single model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy — requests allowed.
    Closed,
    /// Tripped — requests blocked until cooldown expires.
    Open,
    /// Cooldown expired — one probe request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Monotonic millisecond clock anchored at registry construction.
///
/// Readings start at 1 so that 0 can mean "never opened".
#[derive(Debug, Clone, Copy)]
pub struct CircuitClock {
    epoch: Instant,
}

impl CircuitClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }
}

impl Default for CircuitClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free per-model circuit.
#[derive(Debug)]
pub struct ModelCircuit {
    consecutive_failures: AtomicU32,
    /// Clock reading when the circuit last opened, 0 while closed.
    opened_at_ms: AtomicU64,
    /// Set while a half-open probe call is in flight.
    probing: AtomicBool,
    failure_threshold: u32,
    cooldown_ms: u64,
}

impl ModelCircuit {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            probing: AtomicBool::new(false),
            failure_threshold: failure_threshold.max(1),
            cooldown_ms: cooldown.as_millis() as u64,
        }
    }

    /// Current state as seen at `now_ms`.
    pub fn state(&self, now_ms: u64) -> CircuitState {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        if opened_at == 0 {
            return CircuitState::Closed;
        }
        if now_ms.saturating_sub(opened_at) >= self.cooldown_ms {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Whether a call would be admitted: Closed, or HalfOpen with the
    /// probe slot free.
    pub fn is_available(&self, now_ms: u64) -> bool {
        match self.state(now_ms) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.probing.load(Ordering::Acquire),
        }
    }

    /// Admit one call. In half-open only the caller that claims the probe
    /// slot gets a permit.
    pub fn try_acquire(&self, now_ms: u64) -> Option<CircuitPermit<'_>> {
        match self.state(now_ms) {
            CircuitState::Closed => Some(CircuitPermit {
                circuit: self,
                probe: false,
            }),
            CircuitState::Open => None,
            CircuitState::HalfOpen => self
                .probing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| CircuitPermit {
                    circuit: self,
                    probe: true,
                }),
        }
    }

    /// Whether a half-open probe is in flight.
    pub fn is_probing(&self) -> bool {
        self.probing.load(Ordering::Acquire)
    }

    /// Record a success — resets the circuit to Closed.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_ms.store(0, Ordering::Release);
    }

    /// Record a failure. Returns true when this call opened the circuit.
    pub fn record_failure(&self, now_ms: u64) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.failure_threshold {
            return false;
        }

        let mut current = self.opened_at_ms.load(Ordering::Acquire);
        loop {
            // Already open and still cooling down: nothing to move.
            if current != 0 && now_ms.saturating_sub(current) < self.cooldown_ms {
                return false;
            }
            // Closed, or a half-open probe failed: (re)open at `now_ms`.
            match self.opened_at_ms.compare_exchange_weak(
                current,
                now_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}

/// Admission for one call through a [`ModelCircuit`].
///
/// A probe permit holds the half-open slot until dropped. Record the call's
/// outcome on the circuit before dropping it.
#[derive(Debug)]
#[must_use = "dropping the permit ends the admission"]
pub struct CircuitPermit<'a> {
    circuit: &'a ModelCircuit,
    probe: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.probe {
            self.circuit.probing.store(false, Ordering::Release);
        }
    }
}
