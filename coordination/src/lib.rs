//! Inference Coordination Library
//!
//! Decides which backend model serves a document-processing or search
//! request, executes that decision with resilience to partial failure,
//! caches results transparently, and fuses ranked lists for search.
//!
//! # Components
//!
//! ## Routing
//! - `ComplexityAssessor`: content signals and task type to a complexity class
//! - `ModelRegistry`: model catalog with lock-free per-model circuit health
//! - `Router`: complexity + caller weights + registry + cache to a `RoutingDecision`
//!
//! ## Execution
//! - `Dispatcher`: per-task state machine with timeout, backoff, fallback
//!   and tier escalation under the caller deadline
//! - `CachingDispatcher`: cache-aside wrapper around the dispatcher
//!
//! ## Search
//! - `fusion::merge`: reciprocal rank fusion of vector and keyword lists
//!
//! ## Orchestration
//! - `Orchestrator::process_document_tasks`: concurrent fan-out over task types
//! - `Orchestrator::search`: cached, degradable two-source retrieval and fusion
//! - `Orchestrator::invalidate_cache`: removal on document mutation
//!
//! # Usage
//!
//! ```no_run
//! use inference_coordination::{
//!     CoreConfig, MemoryDocumentSource, Orchestrator, ProcessRequest, ScriptedBackend,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let documents = MemoryDocumentSource::new().with_document("org-1", "doc-1", "Quarterly report");
//! let orchestrator = Orchestrator::builder(CoreConfig::from_env()?)
//!     .backend(Arc::new(ScriptedBackend::new()))
//!     .documents(Arc::new(documents))
//!     .build()?;
//!
//! let report = orchestrator
//!     .process_document_tasks(ProcessRequest::new("org-1", "doc-1", ["summary", "risk"]))
//!     .await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod fusion;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod task;

// Re-export task model types
pub use task::{content_hash, PriorityWeights, Task, TaskError, TaskId, TaskType};

// Re-export configuration types
pub use config::{ConfigError, ConfigResult, CoreConfig};

// Re-export registry types
pub use registry::{
    AccuracyClass, ModelHealth, ModelProfile, ModelRegistry, ModelTier, RegistryError,
    SharedModelRegistry,
};

// Re-export routing types
pub use router::{
    ComplexityAssessor, ComplexityClass, DecisionTrace, Router, RouterError, RoutingDecision,
    TraceStep,
};

// Re-export cache types
pub use cache::{
    CacheAside, CacheEntry, CacheError, CacheKey, CacheStatsSnapshot, CacheStore,
    MemoryCacheStore, SharedCacheStore,
};

// Re-export dispatch types
pub use dispatch::{
    Backend, BackendError, CachingDispatcher, DispatchError, DispatchReport, Dispatcher,
    ScriptStep, ScriptedBackend, SharedBackend, TaskOutput,
};

// Re-export fusion types
pub use fusion::{merge, FusedResult, FusionDiagnostics, FusionOutcome, RankSource, RankedHit};

// Re-export orchestrator types
pub use orchestrator::{
    DocumentContent, DocumentSource, MemoryDocumentSource, Orchestrator, OrchestratorBuilder,
    OrchestratorError, ProcessReport, ProcessRequest, RankedRetriever, SearchError, SearchQuery,
    SearchResponse, SourceError, StaticRetriever, TaskFailure,
};
