//! Content-addressed cache keys
//!
//! ```text
//! {namespace}:{org}:{doc}:{digest}
//!                          └── blake3(content_hash ‖ task_type ‖ tier)
//! ```
//!
//! The digest is a pure function of its three inputs. The org/doc prefix is
//! only a scope so that invalidation can remove a document's entries by
//! pattern without knowing their digests.

use crate::registry::ModelTier;
use crate::task::TaskType;
use serde::{Deserialize, Serialize};

/// Reserved doc segment holding an org's search merges.
pub const SEARCH_SCOPE: &str = "_search";

const FIELD_SEPARATOR: u8 = 0x1f;

/// What a key is scoped to inside its org
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    Document(String),
    Search,
}

/// Key of one cached result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    namespace: String,
    org_id: String,
    scope: KeyScope,
    digest: String,
}

impl CacheKey {
    /// Digest of (content_hash, task_type, tier).
    ///
    /// Search merges have no tier and hash the literal `none`.
    pub fn digest(content_hash: &str, task_type: TaskType, tier: Option<ModelTier>) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(content_hash.as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
        hasher.update(task_type.as_str().as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
        hasher.update(tier.map(|t| t.as_str()).unwrap_or("none").as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Key for a document task.
    pub fn new(
        namespace: impl Into<String>,
        org_id: impl Into<String>,
        doc_id: impl Into<String>,
        content_hash: &str,
        task_type: TaskType,
        tier: Option<ModelTier>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            org_id: org_id.into(),
            scope: KeyScope::Document(doc_id.into()),
            digest: Self::digest(content_hash, task_type, tier),
        }
    }

    /// Key for a search merge, scoped to the org's search segment.
    pub fn for_search(
        namespace: impl Into<String>,
        org_id: impl Into<String>,
        query_hash: &str,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            org_id: org_id.into(),
            scope: KeyScope::Search,
            digest: Self::digest(query_hash, TaskType::Search, None),
        }
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// Document the key belongs to, `None` for search merges.
    pub fn doc_id(&self) -> Option<&str> {
        match &self.scope {
            KeyScope::Document(doc) => Some(doc),
            KeyScope::Search => None,
        }
    }

    pub fn digest_hex(&self) -> &str {
        &self.digest
    }

    pub fn is_search(&self) -> bool {
        self.scope == KeyScope::Search
    }

    /// Store key string.
    pub fn render(&self) -> String {
        let doc = match &self.scope {
            KeyScope::Document(doc) => escape_segment(doc),
            KeyScope::Search => SEARCH_SCOPE.to_string(),
        };
        format!(
            "{}:{}:{}:{}",
            self.namespace,
            escape_segment(&self.org_id),
            doc,
            self.digest
        )
    }

    /// Glob matching every entry of one document.
    pub fn doc_pattern(namespace: &str, org_id: &str, doc_id: &str) -> String {
        format!(
            "{}:{}:{}:*",
            namespace,
            escape_segment(org_id),
            escape_segment(doc_id)
        )
    }

    /// Glob matching the org's search merges.
    pub fn search_pattern(namespace: &str, org_id: &str) -> String {
        format!("{}:{}:{}:*", namespace, escape_segment(org_id), SEARCH_SCOPE)
    }

    /// Glob matching every entry of an org.
    pub fn org_pattern(namespace: &str, org_id: &str) -> String {
        format!("{}:{}:*", namespace, escape_segment(org_id))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Percent-escape a scope segment.
///
/// Covers the key separator, glob metacharacters and `%` itself. A leading
/// `_` is escaped so no caller id can collide with a reserved scope.
pub fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, c) in raw.chars().enumerate() {
        match c {
            ':' | '*' | '?' | '[' | ']' | '{' | '}' | '\\' | '!' | '%' | ',' => {
                out.push_str(&format!("%{:02X}", c as u32));
            }
            '_' if i == 0 => out.push_str("%5F"),
            _ => out.push(c),
        }
    }
    out
}
