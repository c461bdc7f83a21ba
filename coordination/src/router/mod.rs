//! Router Module
//!
//! Decides which backend tier and model serve a task, based on:
//! - Content complexity (from the assessor)
//! - Caller priority weights
//! - Per-task-type accuracy floors
//! - Live model health (from the registry)
//! - Cached results
//!
//! # Escalation
//!
//! ```text
//! Candidate tier  | No model available     | Nothing left
//! ----------------|------------------------|----------------------
//! fast_cheap      | balanced → premium     | RegistryExhausted
//! balanced        | premium                | RegistryExhausted
//! premium         | -                      | RegistryExhausted
//! ```
//!
//! Escalation only ever moves up the ladder.

pub mod circuit_breaker;
pub mod classifier;
pub mod decision;
pub mod prompts;
pub mod task_router;

pub use circuit_breaker::{CircuitClock, CircuitPermit, CircuitState, ModelCircuit};
pub use classifier::{ComplexityAssessment, ComplexityAssessor, ComplexityClass, ContentSignals};
pub use decision::{DecisionTrace, RoutingDecision, TraceStep};
pub use prompts::TaskPrompt;
pub use task_router::{candidate_tier, Router, RouterError, RouterResult};
