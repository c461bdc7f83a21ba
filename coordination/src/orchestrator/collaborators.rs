//! Collaborator seams
//!
//! The orchestrator never owns documents or indexes. It reads content
//! through [`DocumentSource`] and already-ranked candidate lists through
//! [`RankedRetriever`]; the surrounding system supplies both.

use super::SearchQuery;
use crate::fusion::{top_hits, RankedHit};
use crate::task::content_hash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Errors surfaced by collaborators
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SourceError {
    #[error("Document {doc_id} not found in org {org_id}")]
    NotFound { org_id: String, doc_id: String },

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Document body plus its canonical hash
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentContent {
    pub content: Arc<str>,
    pub content_hash: String,
}

impl DocumentContent {
    /// Wrap content, hashing it with blake3.
    pub fn new(content: impl Into<Arc<str>>) -> Self {
        let content: Arc<str> = content.into();
        let content_hash = content_hash(content.as_bytes());
        Self {
            content,
            content_hash,
        }
    }

    /// Wrap content with a hash computed by the collaborator.
    pub fn with_hash(content: impl Into<Arc<str>>, content_hash: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_hash: content_hash.into(),
        }
    }
}

/// Source of document content
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn get_document(&self, org_id: &str, doc_id: &str)
        -> Result<DocumentContent, SourceError>;
}

pub type SharedDocumentSource = Arc<dyn DocumentSource>;

/// One ranked candidate list for a search query
#[async_trait]
pub trait RankedRetriever: Send + Sync {
    /// Up to `depth` hits for `query`, any order.
    async fn retrieve(&self, query: &SearchQuery, depth: usize)
        -> Result<Vec<RankedHit>, SourceError>;
}

pub type SharedRetriever = Arc<dyn RankedRetriever>;

/// Retriever that never finds anything.
///
/// Used when a deployment has no index for one of the two sources.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyRetriever;

#[async_trait]
impl RankedRetriever for EmptyRetriever {
    async fn retrieve(
        &self,
        _query: &SearchQuery,
        _depth: usize,
    ) -> Result<Vec<RankedHit>, SourceError> {
        Ok(Vec::new())
    }
}

/// Retriever serving a fixed list, or a fixed failure
#[derive(Debug, Clone)]
pub struct StaticRetriever {
    result: Result<Vec<RankedHit>, SourceError>,
}

impl StaticRetriever {
    pub fn new(hits: Vec<RankedHit>) -> Self {
        Self { result: Ok(hits) }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            result: Err(SourceError::Unavailable(reason.into())),
        }
    }
}

#[async_trait]
impl RankedRetriever for StaticRetriever {
    async fn retrieve(
        &self,
        _query: &SearchQuery,
        depth: usize,
    ) -> Result<Vec<RankedHit>, SourceError> {
        self.result.clone().map(|hits| top_hits(hits, depth))
    }
}

/// In-process document source keyed by `(org_id, doc_id)`
#[derive(Debug, Default)]
pub struct MemoryDocumentSource {
    docs: RwLock<HashMap<(String, String), DocumentContent>>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document, returning its new hash.
    pub fn put(&self, org_id: &str, doc_id: &str, content: &str) -> String {
        let doc = DocumentContent::new(content);
        let hash = doc.content_hash.clone();
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert((org_id.to_string(), doc_id.to_string()), doc);
        hash
    }

    pub fn with_document(self, org_id: &str, doc_id: &str, content: &str) -> Self {
        self.put(org_id, doc_id, content);
        self
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentSource {
    async fn get_document(
        &self,
        org_id: &str,
        doc_id: &str,
    ) -> Result<DocumentContent, SourceError> {
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.get(&(org_id.to_string(), doc_id.to_string()))
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                org_id: org_id.to_string(),
                doc_id: doc_id.to_string(),
            })
    }
}
