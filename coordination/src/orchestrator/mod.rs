//! Orchestrator
//!
//! Wires the router and the caching dispatcher for document processing,
//! and the router and the rank fusion merger for search.
//!
//! # Document processing
//!
//! ```text
//! fetch content once
//!   ├─ summary      ─ route ─ dispatch ─┐
//!   ├─ action_items ─ route ─ dispatch ─┤  join_all (no fail-fast)
//!   ├─ risk         ─ route ─ dispatch ─┤
//!   └─ embedding    ─ route ─ dispatch ─┘
//!                                        └─> map[type -> Ok | TaskFailure]
//! ```
//!
//! Only a failed document fetch fails the whole request. Every branch
//! otherwise reaches its own terminal state and the aggregate mixes
//! successes with typed per-branch failures.
//!
//! # Search
//!
//! The query is routed as a `search` task for the cache check only. On a
//! miss both retrievers run concurrently, a single failing retriever
//! degrades to the other list, and the merged list is cached with the
//! ephemeral TTL.

pub mod collaborators;

pub use collaborators::{
    DocumentContent, DocumentSource, EmptyRetriever, MemoryDocumentSource, RankedRetriever,
    SharedDocumentSource, SharedRetriever, SourceError, StaticRetriever,
};

#[cfg(test)]
pub use collaborators::MockDocumentSource;

use crate::cache::{
    CacheAside, CacheError, CacheStatsSnapshot, MemoryCacheStore, SharedCacheAside,
    SharedCacheStore, SEARCH_SCOPE,
};
use crate::config::{ConfigError, CoreConfig};
use crate::dispatch::{CachingDispatcher, DispatchError, Dispatcher, SharedBackend, TaskOutput};
use crate::fusion::{merge, FusedResult, FusionDiagnostics, FusionOutcome, RankSource, RankedHit};
use crate::registry::{ModelHealth, ModelRegistry, RegistryError, SharedModelRegistry};
use crate::router::{Router, RouterError};
use crate::task::{PriorityWeights, Task, TaskType, DEFAULT_TASK_DEADLINE};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why one processing branch produced no result
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "stage", content = "error", rename_all = "snake_case")]
pub enum TaskFailure {
    #[error("routing failed: {0}")]
    Routing(RouterError),

    #[error("dispatch failed: {0}")]
    Dispatch(DispatchError),
}

impl From<RouterError> for TaskFailure {
    fn from(err: RouterError) -> Self {
        Self::Routing(err)
    }
}

impl From<DispatchError> for TaskFailure {
    fn from(err: DispatchError) -> Self {
        Self::Dispatch(err)
    }
}

/// Errors that fail a whole orchestrator call
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Document fetch failed: {0}")]
    Document(#[from] SourceError),

    #[error("Cache operation failed: {0}")]
    Cache(#[from] CacheError),

    #[error("Model registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors that fail a search
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchError {
    #[error("Search query has neither an embedding nor text")]
    EmptyInput,

    #[error("Search routing failed: {reason}")]
    Routing { reason: String },

    #[error("All retrievers failed (vector: {vector}; keyword: {keyword})")]
    RetrievalFailed { vector: String, keyword: String },

    #[error("Search deadline elapsed before retrieval finished")]
    Timeout,
}

pub type SearchResult<T> = Result<T, SearchError>;

/// Request to run several task types over one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub org_id: String,
    pub doc_id: String,
    /// Raw task type names, validated per branch
    pub task_types: Vec<String>,
    #[serde(default)]
    pub weights: PriorityWeights,
    /// Overall deadline relative to the call
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Question for `qa` branches
    #[serde(default)]
    pub question: Option<String>,
}

impl ProcessRequest {
    pub fn new<I, S>(org_id: impl Into<String>, doc_id: impl Into<String>, task_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            org_id: org_id.into(),
            doc_id: doc_id.into(),
            task_types: task_types.into_iter().map(Into::into).collect(),
            weights: PriorityWeights::default(),
            timeout: None,
            question: None,
        }
    }

    pub fn with_weights(mut self, weights: PriorityWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }
}

/// Aggregate of one document-processing call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    pub org_id: String,
    pub doc_id: String,
    pub content_hash: String,
    /// One entry per distinct requested type name
    pub results: BTreeMap<String, Result<TaskOutput, TaskFailure>>,
}

impl ProcessReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.values().filter(|r| r.is_err()).count()
    }

    pub fn total_cost(&self) -> f64 {
        self.results
            .values()
            .filter_map(|r| r.as_ref().ok())
            .map(|out| out.cost)
            .sum()
    }

    /// Get a compact summary for logging
    pub fn summary(&self) -> String {
        format!(
            "doc={} ok={} failed={} cost={:.4}",
            self.doc_id,
            self.succeeded(),
            self.failed(),
            self.total_cost()
        )
    }
}

/// Search request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub org_id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub limit: usize,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl SearchQuery {
    pub fn new(
        org_id: impl Into<String>,
        embedding: Vec<f32>,
        text: impl Into<String>,
        limit: usize,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            embedding,
            text: text.into(),
            limit,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn wants_vector(&self) -> bool {
        !self.embedding.is_empty()
    }

    fn wants_keyword(&self) -> bool {
        !self.text.trim().is_empty()
    }

    /// Content-addressed identity of the query under fusion constant `k`.
    pub fn query_hash(&self, k: f64) -> String {
        let mut hasher = blake3::Hasher::new();
        for value in &self.embedding {
            hasher.update(&value.to_le_bytes());
        }
        hasher.update(&[0x1f]);
        hasher.update(self.text.trim().as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(&(self.limit as u64).to_le_bytes());
        hasher.update(&k.to_bits().to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Search answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<FusedResult>,
    pub diagnostics: FusionDiagnostics,
    pub cache_hit: bool,
    /// Sources whose retriever failed and were left out of the merge
    pub degraded: Vec<RankSource>,
}

impl SearchResponse {
    /// `(doc_id, fused_score)` pairs in order.
    pub fn scored_ids(&self) -> Vec<(String, f64)> {
        self.results
            .iter()
            .map(|r| (r.doc_id.clone(), r.fused_score))
            .collect()
    }
}

/// Entry point for collaborators
pub struct Orchestrator {
    config: CoreConfig,
    registry: SharedModelRegistry,
    cache: SharedCacheAside,
    router: Router,
    dispatcher: CachingDispatcher,
    documents: SharedDocumentSource,
    vector: SharedRetriever,
    keyword: SharedRetriever,
}

impl Orchestrator {
    pub fn builder(config: CoreConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &SharedModelRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &SharedCacheAside {
        &self.cache
    }

    /// Run every requested task type over one document concurrently.
    pub async fn process_document_tasks(
        &self,
        request: ProcessRequest,
    ) -> OrchestratorResult<ProcessReport> {
        let doc = self
            .documents
            .get_document(&request.org_id, &request.doc_id)
            .await?;
        let deadline = Instant::now() + request.timeout.unwrap_or(DEFAULT_TASK_DEADLINE);

        let mut seen = BTreeSet::new();
        let names: Vec<String> = request
            .task_types
            .iter()
            .map(|raw| raw.trim().to_string())
            .filter(|name| seen.insert(name.clone()))
            .collect();

        let branches = names
            .iter()
            .map(|name| self.run_branch(name, &request, &doc, deadline));
        let outcomes = join_all(branches).await;

        let report = ProcessReport {
            org_id: request.org_id.clone(),
            doc_id: request.doc_id.clone(),
            content_hash: doc.content_hash.clone(),
            results: names.into_iter().zip(outcomes).collect(),
        };
        info!(org = %report.org_id, "{}", report.summary());
        Ok(report)
    }

    async fn run_branch(
        &self,
        name: &str,
        request: &ProcessRequest,
        doc: &DocumentContent,
        deadline: Instant,
    ) -> Result<TaskOutput, TaskFailure> {
        let task_type = Router::parse_task_type(name)?;
        if !task_type.requires_model() {
            return Err(RouterError::InvalidTask(format!(
                "{} is served by search, not document processing",
                task_type
            ))
            .into());
        }

        let mut builder = Task::builder(
            task_type,
            request.org_id.as_str(),
            request.doc_id.as_str(),
            doc.content.clone(),
        )
        .content_hash(doc.content_hash.as_str())
        .weights(request.weights)
        .deadline(deadline);
        if let Some(question) = &request.question {
            builder = builder.question(question.as_str());
        }
        let task = builder.build();

        let decision = self.router.select(&task).await?;
        let report = self.dispatcher.run(&task, &decision).await;
        debug!(task_id = task.id(), task_type = %task_type, "{}", report.summary());
        report.outcome.map_err(TaskFailure::from)
    }

    /// Fuse vector and keyword candidates for a query.
    pub async fn search(&self, query: &SearchQuery) -> SearchResult<SearchResponse> {
        if !query.wants_vector() && !query.wants_keyword() {
            return Err(SearchError::EmptyInput);
        }
        let deadline = Instant::now() + query.timeout.unwrap_or(DEFAULT_TASK_DEADLINE);

        // The assessor only needs non-empty content; the hash carries identity.
        let content: Arc<str> = if query.wants_keyword() {
            Arc::from(query.text.trim())
        } else {
            Arc::from(format!("embedding[{}]", query.embedding.len()))
        };
        let task = Task::builder(TaskType::Search, query.org_id.as_str(), SEARCH_SCOPE, content)
            .content_hash(query.query_hash(self.config.fusion.k))
            .deadline(deadline)
            .build();

        let decision = self
            .router
            .select(&task)
            .await
            .map_err(|e| SearchError::Routing {
                reason: e.to_string(),
            })?;

        if let Some(value) = decision.cached_value.clone() {
            match serde_json::from_value::<FusionOutcome>(value) {
                Ok(outcome) => {
                    debug!(task_id = task.id(), "search: served from cache");
                    return Ok(SearchResponse {
                        results: outcome.results,
                        diagnostics: outcome.diagnostics,
                        cache_hit: true,
                        degraded: Vec::new(),
                    });
                }
                Err(e) => {
                    warn!(task_id = task.id(), error = %e, "search: unreadable cached merge, recomputing");
                }
            }
        }

        let depth = self.config.fusion.candidate_depth(query.limit);
        let vector = async {
            if query.wants_vector() {
                self.vector.retrieve(query, depth).await
            } else {
                Ok(Vec::new())
            }
        };
        let keyword = async {
            if query.wants_keyword() {
                self.keyword.retrieve(query, depth).await
            } else {
                Ok(Vec::new())
            }
        };
        let (vector, keyword) = tokio::time::timeout_at(deadline, async {
            tokio::join!(vector, keyword)
        })
        .await
        .map_err(|_| SearchError::Timeout)?;

        let (vector_hits, vector_err) = split_retrieval(vector);
        let (keyword_hits, keyword_err) = split_retrieval(keyword);

        let all_failed = match (&vector_err, &keyword_err) {
            (Some(_), Some(_)) => true,
            (Some(_), None) => !query.wants_keyword(),
            (None, Some(_)) => !query.wants_vector(),
            (None, None) => false,
        };
        if all_failed {
            return Err(SearchError::RetrievalFailed {
                vector: vector_err.unwrap_or_else(|| "not requested".to_string()),
                keyword: keyword_err.unwrap_or_else(|| "not requested".to_string()),
            });
        }

        let mut degraded = Vec::new();
        for (source, err) in [
            (RankSource::Vector, &vector_err),
            (RankSource::Keyword, &keyword_err),
        ] {
            if let Some(reason) = err {
                warn!(source = %source, error = %reason, "search: retriever failed, degrading to the other list");
                degraded.push(source);
            }
        }

        let outcome = merge(&vector_hits, &keyword_hits, query.limit, &self.config.fusion);

        // A degraded merge is served once but never cached.
        if degraded.is_empty() {
            match serde_json::to_value(&outcome) {
                Ok(value) => {
                    self.cache
                        .store(&decision.cache_key, TaskType::Search, value)
                        .await;
                }
                Err(e) => warn!(error = %e, "search: merge not serialisable, skipping cache"),
            }
        }

        info!(
            org = %query.org_id,
            vector = vector_hits.len(),
            keyword = keyword_hits.len(),
            results = outcome.results.len(),
            degraded = degraded.len(),
            "search: merged"
        );
        Ok(SearchResponse {
            results: outcome.results,
            diagnostics: outcome.diagnostics,
            cache_hit: false,
            degraded,
        })
    }

    /// Remove cached results after a document mutation or settings change.
    ///
    /// `None` clears every entry of the org. Returns the removed count.
    pub async fn invalidate_cache(
        &self,
        org_id: &str,
        doc_id: Option<&str>,
    ) -> OrchestratorResult<usize> {
        Ok(self.cache.invalidate(org_id, doc_id).await?)
    }

    pub async fn invalidate_all(&self, org_id: &str) -> OrchestratorResult<usize> {
        Ok(self.cache.invalidate_all(org_id).await?)
    }

    pub fn health(&self) -> Vec<ModelHealth> {
        self.registry.health_snapshot()
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }
}

fn split_retrieval(
    result: Result<Vec<RankedHit>, SourceError>,
) -> (Vec<RankedHit>, Option<String>) {
    match result {
        Ok(hits) => (hits, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: CoreConfig,
    backend: Option<SharedBackend>,
    documents: Option<SharedDocumentSource>,
    vector: Option<SharedRetriever>,
    keyword: Option<SharedRetriever>,
    cache_store: Option<SharedCacheStore>,
    registry: Option<SharedModelRegistry>,
}

impl OrchestratorBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            backend: None,
            documents: None,
            vector: None,
            keyword: None,
            cache_store: None,
            registry: None,
        }
    }

    pub fn backend(mut self, backend: SharedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn documents(mut self, documents: SharedDocumentSource) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn vector_retriever(mut self, retriever: SharedRetriever) -> Self {
        self.vector = Some(retriever);
        self
    }

    pub fn keyword_retriever(mut self, retriever: SharedRetriever) -> Self {
        self.keyword = Some(retriever);
        self
    }

    /// Use an external cache store instead of the in-memory one.
    pub fn cache_store(mut self, store: SharedCacheStore) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Share a registry (and its circuit state) with other components.
    pub fn registry(mut self, registry: SharedModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> OrchestratorResult<Orchestrator> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or(OrchestratorError::MissingCollaborator("backend"))?;
        let documents = self
            .documents
            .ok_or(OrchestratorError::MissingCollaborator("document source"))?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => ModelRegistry::from_config(&self.config.registry)?.shared(),
        };
        let store: SharedCacheStore = match self.cache_store {
            Some(store) => store,
            None => Arc::new(MemoryCacheStore::with_capacity_limit(
                self.config.cache.max_entries,
            )),
        };
        let vector: SharedRetriever = match self.vector {
            Some(retriever) => retriever,
            None => Arc::new(EmptyRetriever),
        };
        let keyword: SharedRetriever = match self.keyword {
            Some(retriever) => retriever,
            None => Arc::new(EmptyRetriever),
        };
        let cache: SharedCacheAside = Arc::new(CacheAside::new(store, self.config.cache.clone()));

        let router = Router::from_config(&self.config, registry.clone(), cache.clone());
        let dispatcher = CachingDispatcher::new(
            Dispatcher::from_config(&self.config, backend, registry.clone()),
            cache.clone(),
        );

        Ok(Orchestrator {
            config: self.config,
            registry,
            cache,
            router,
            dispatcher,
            documents,
            vector,
            keyword,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{BackendError, ScriptStep, ScriptedBackend};
    use crate::task::content_hash;

    const CONTRACT: &str = "Master services agreement between Acme and Globex.";

    fn mock_source(times: usize) -> MockDocumentSource {
        let mut source = MockDocumentSource::new();
        source
            .expect_get_document()
            .times(times)
            .returning(|_, _| Ok(DocumentContent::new(CONTRACT)));
        source
    }

    fn orchestrator(
        backend: ScriptedBackend,
        source: impl DocumentSource + 'static,
    ) -> (Orchestrator, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let orch = Orchestrator::builder(CoreConfig::default())
            .backend(backend.clone())
            .documents(Arc::new(source))
            .build()
            .unwrap();
        (orch, backend)
    }

    #[tokio::test]
    async fn test_fetches_document_once_for_all_branches() {
        let (orch, backend) = orchestrator(ScriptedBackend::new(), mock_source(1));
        let request = ProcessRequest::new("org-1", "doc-1", ["summary", "action_items", "risk"]);

        let report = orch.process_document_tasks(request).await.unwrap();

        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.content_hash, content_hash(CONTRACT.as_bytes()));
        assert_eq!(backend.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_and_search_types_fail_per_branch() {
        let (orch, _) = orchestrator(ScriptedBackend::new(), mock_source(1));
        let request = ProcessRequest::new("org-1", "doc-1", ["summary", "translate", "search"]);

        let report = orch.process_document_tasks(request).await.unwrap();

        assert!(report.results["summary"].is_ok());
        assert!(matches!(
            report.results["translate"],
            Err(TaskFailure::Routing(RouterError::InvalidTask(_)))
        ));
        assert!(matches!(
            report.results["search"],
            Err(TaskFailure::Routing(RouterError::InvalidTask(_)))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_type_names_run_once() {
        let (orch, backend) = orchestrator(ScriptedBackend::new(), mock_source(1));
        let request = ProcessRequest::new("org-1", "doc-1", ["summary", " summary", "summary"]);

        let report = orch.process_document_tasks(request).await.unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(backend.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_document_fetch_failure_fails_request() {
        let mut source = MockDocumentSource::new();
        source.expect_get_document().returning(|org, doc| {
            Err(SourceError::NotFound {
                org_id: org.to_string(),
                doc_id: doc.to_string(),
            })
        });
        let (orch, backend) = orchestrator(ScriptedBackend::new(), source);

        let err = orch
            .process_document_tasks(ProcessRequest::new("org-1", "missing", ["summary"]))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Document(SourceError::NotFound { .. })));
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_rejected_branch_does_not_discard_others() {
        let backend = ScriptedBackend::new()
            .always("mistral-small-instruct", ScriptStep::Fail(BackendError::Rejected("bad prompt".into())))
            .always("llama-3.1-8b-instruct", ScriptStep::Fail(BackendError::Rejected("bad prompt".into())));
        let (orch, _) = orchestrator(backend, mock_source(1));
        // High cost weight keeps simple branches on fast_cheap; risk floors higher.
        let weights = PriorityWeights::new(0.8, 0.1, 0.1).unwrap();
        let request = ProcessRequest::new("org-1", "doc-1", ["summary", "risk"]).with_weights(weights);

        let report = orch.process_document_tasks(request).await.unwrap();

        assert!(matches!(
            report.results["summary"],
            Err(TaskFailure::Dispatch(DispatchError::ModelError { .. }))
        ));
        assert!(report.results["risk"].is_ok());
    }

    #[tokio::test]
    async fn test_search_requires_some_input() {
        let (orch, _) = orchestrator(ScriptedBackend::new(), MemoryDocumentSource::new());
        let err = orch
            .search(&SearchQuery::new("org-1", Vec::new(), "  ", 5))
            .await
            .unwrap_err();
        assert_eq!(err, SearchError::EmptyInput);
    }

    #[test]
    fn test_query_hash_depends_on_every_input() {
        let base = SearchQuery::new("org-1", vec![0.5, 0.25], "revenue", 10);
        let hash = base.query_hash(60.0);
        assert_eq!(hash, base.clone().query_hash(60.0));

        let mut other = base.clone();
        other.limit = 11;
        assert_ne!(hash, other.query_hash(60.0));
        let mut other = base.clone();
        other.embedding[0] = 0.6;
        assert_ne!(hash, other.query_hash(60.0));
        assert_ne!(hash, base.query_hash(30.0));
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = Orchestrator::builder(CoreConfig::default())
            .documents(Arc::new(MemoryDocumentSource::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::MissingCollaborator("backend")));
    }
}
