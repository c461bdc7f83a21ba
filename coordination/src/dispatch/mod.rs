//! Dispatch: executes routing decisions against backend models with
//! timeout, retry, fallback and tier escalation.

pub mod backend;
pub mod dispatcher;
pub mod errors;
pub mod state_machine;

pub use backend::{Backend, BackendCall, BackendError, ScriptStep, ScriptedBackend, SharedBackend};
pub use dispatcher::{
    AttemptOutcome, AttemptRecord, CachingDispatcher, DispatchReport, Dispatcher, TaskOutput,
};
pub use errors::{DispatchError, DispatchResult};
pub use state_machine::{
    DispatchCommand, DispatchEvent, DispatchMachine, DispatchOutcome, DispatchState, Transition,
};
