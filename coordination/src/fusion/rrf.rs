//! Reciprocal rank fusion
//!
//! ```text
//! fused(d) = Σ 1 / (k + rank_l(d))    over every list l containing d
//! ```
//!
//! Each input list is normalised first: duplicate ids collapse to their max
//! score, then the list is ordered by raw score (desc) and doc_id (asc) so a
//! rank always reflects the retriever's own scoring. Output is ordered by
//! fused score (desc), then raw vector score (desc, absent lowest), then
//! doc_id (asc). The merge is a pure function of its inputs.

use crate::config::FusionConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// One hit from a retriever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    pub doc_id: String,
    pub score: f64,
}

impl RankedHit {
    pub fn new(doc_id: impl Into<String>, score: f64) -> Self {
        Self {
            doc_id: doc_id.into(),
            score,
        }
    }
}

/// Which retriever a list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankSource {
    Vector,
    Keyword,
}

impl std::fmt::Display for RankSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vector => write!(f, "vector"),
            Self::Keyword => write!(f, "keyword"),
        }
    }
}

/// One merged result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub doc_id: String,
    /// Raw vector score (`None` when absent or non-finite)
    pub vector_score: Option<f64>,
    pub keyword_score: Option<f64>,
    pub vector_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
    pub fused_score: f64,
    /// 1-based position in the merged list
    pub position: usize,
}

/// Input contract violations observed during a merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionDiagnostics {
    pub vector_duplicates: Vec<String>,
    pub keyword_duplicates: Vec<String>,
    pub non_finite_scores: usize,
}

impl FusionDiagnostics {
    pub fn is_clean(&self) -> bool {
        self.vector_duplicates.is_empty()
            && self.keyword_duplicates.is_empty()
            && self.non_finite_scores == 0
    }
}

/// Merged list plus diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionOutcome {
    pub results: Vec<FusedResult>,
    pub diagnostics: FusionDiagnostics,
}

impl FusionOutcome {
    /// `(doc_id, fused_score)` pairs in order.
    pub fn scored_ids(&self) -> Vec<(String, f64)> {
        self.results
            .iter()
            .map(|r| (r.doc_id.clone(), r.fused_score))
            .collect()
    }
}

/// Score used for ordering: non-finite values sort lowest.
fn order_score(score: f64) -> f64 {
    if score.is_finite() {
        score
    } else {
        f64::NEG_INFINITY
    }
}

/// Best `depth` hits of an unordered list, by raw score (non-finite last).
///
/// Ties keep their input order. Retrievers cut their lists with this so a
/// depth limit never drops a higher-scored hit.
pub fn top_hits(mut hits: Vec<RankedHit>, depth: usize) -> Vec<RankedHit> {
    hits.sort_by(|a, b| order_score(b.score).total_cmp(&order_score(a.score)));
    hits.truncate(depth);
    hits
}

/// Collapse duplicates (max score wins) and order by score desc, id asc.
///
/// Returns the normalised list, the duplicated ids (sorted) and the count of
/// non-finite scores seen.
fn normalise(hits: &[RankedHit]) -> (Vec<RankedHit>, Vec<String>, usize) {
    let mut best: HashMap<&str, f64> = HashMap::with_capacity(hits.len());
    let mut duplicates: Vec<String> = Vec::new();
    let mut non_finite = 0;

    for hit in hits {
        if !hit.score.is_finite() {
            non_finite += 1;
        }
        let score = order_score(hit.score);
        match best.entry(hit.doc_id.as_str()) {
            Entry::Occupied(mut existing) => {
                if !duplicates.contains(&hit.doc_id) {
                    duplicates.push(hit.doc_id.clone());
                }
                if score > *existing.get() {
                    existing.insert(score);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(score);
            }
        }
    }

    let mut list: Vec<RankedHit> = best
        .into_iter()
        .map(|(id, score)| RankedHit::new(id, score))
        .collect();
    list.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    duplicates.sort();
    (list, duplicates, non_finite)
}

#[derive(Default)]
struct Accumulator {
    vector_score: Option<f64>,
    keyword_score: Option<f64>,
    vector_rank: Option<usize>,
    keyword_rank: Option<usize>,
    fused: f64,
}

fn finite(score: f64) -> Option<f64> {
    score.is_finite().then_some(score)
}

/// Merge a vector list and a keyword list with RRF, keeping `limit` results.
pub fn merge(
    vector: &[RankedHit],
    keyword: &[RankedHit],
    limit: usize,
    config: &FusionConfig,
) -> FusionOutcome {
    let k = config.k;
    let (vector, vector_dups, vector_bad) = normalise(vector);
    let (keyword, keyword_dups, keyword_bad) = normalise(keyword);

    let diagnostics = FusionDiagnostics {
        vector_duplicates: vector_dups,
        keyword_duplicates: keyword_dups,
        non_finite_scores: vector_bad + keyword_bad,
    };
    for (source, dups) in [
        (RankSource::Vector, &diagnostics.vector_duplicates),
        (RankSource::Keyword, &diagnostics.keyword_duplicates),
    ] {
        if !dups.is_empty() {
            warn!(
                source = %source,
                duplicates = ?dups,
                "fusion: duplicate doc ids in ranked list, keeping max score"
            );
        }
    }

    if limit == 0 {
        return FusionOutcome {
            results: Vec::new(),
            diagnostics,
        };
    }

    let mut acc: BTreeMap<&str, Accumulator> = BTreeMap::new();
    for (idx, hit) in vector.iter().enumerate() {
        let rank = idx + 1;
        let entry = acc.entry(hit.doc_id.as_str()).or_default();
        entry.vector_score = finite(hit.score);
        entry.vector_rank = Some(rank);
        entry.fused += 1.0 / (k + rank as f64);
    }
    for (idx, hit) in keyword.iter().enumerate() {
        let rank = idx + 1;
        let entry = acc.entry(hit.doc_id.as_str()).or_default();
        entry.keyword_score = finite(hit.score);
        entry.keyword_rank = Some(rank);
        entry.fused += 1.0 / (k + rank as f64);
    }

    let mut results: Vec<FusedResult> = acc
        .into_iter()
        .map(|(doc_id, a)| FusedResult {
            doc_id: doc_id.to_string(),
            vector_score: a.vector_score,
            keyword_score: a.keyword_score,
            vector_rank: a.vector_rank,
            keyword_rank: a.keyword_rank,
            fused_score: a.fused,
            position: 0,
        })
        .collect();

    results.sort_by(compare_fused);
    results.truncate(limit);
    for (idx, result) in results.iter_mut().enumerate() {
        result.position = idx + 1;
    }

    FusionOutcome {
        results,
        diagnostics,
    }
}

/// Total order over merged results.
fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    let vector = |r: &FusedResult| r.vector_score.unwrap_or(f64::NEG_INFINITY);
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| vector(b).total_cmp(&vector(a)))
        .then_with(|| a.doc_id.cmp(&b.doc_id))
}
