//! Complexity assessment for (document, task) pairs.
//!
//! Runs BEFORE the router picks a candidate tier. The assessor is a pure
//! function of the content and the task type: no I/O, no clock, no shared
//! state, so identical inputs always give the identical class.
//!
//! # Scoring
//!
//! ```text
//! Signal                          | Points
//! --------------------------------|-------
//! base                            | 1
//! chars > medium_length_chars     | +1
//! chars > long_length_chars       | +1
//! markers > structured_markers    | +1
//! markers > dense_markers         | +1
//! >= 3 risk vocabulary hits       | +1
//! --------------------------------|-------
//! 1-2 simple | 3 moderate | 4-5 complex
//! ```

use crate::config::AssessorConfig;
use crate::task::TaskType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Markdown-style heading or an all-caps section title.
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:#{1,6}\s+\S|[A-Z][A-Z0-9 ]{3,}:?\s*$)")
        .expect("HEADING_RE regex should compile")
});

/// Bulleted list item.
static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*[-*•]\s+\S").expect("LIST_ITEM_RE regex should compile")
});

/// Pipe-delimited table row.
static TABLE_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\|.*\|\s*$").expect("TABLE_ROW_RE regex should compile")
});

/// Numbered clause such as `1.`, `2.3`, `(a)` or `Section 4`.
static CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(?:\d+(?:\.\d+)*[.)]?\s+\S|\([a-z0-9]{1,3}\)\s+\S|(?:section|article|clause)\s+\d+)")
        .expect("CLAUSE_RE regex should compile")
});

/// Legal and financial vocabulary that signals careful reading is needed.
static RISK_VOCAB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:indemnif\w*|liabilit\w*|warrant\w*|breach\w*|terminat\w*|penalt\w*|damages|covenant\w*|jurisdiction|arbitration|confidential\w*|default|material adverse|force majeure|non-compete)\b",
    )
    .expect("RISK_VOCAB_RE regex should compile")
});

/// Risk vocabulary hits that add a complexity point.
const RISK_VOCAB_THRESHOLD: usize = 3;

/// Complexity class of a (document, task) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityClass {
    /// Map a 1-5 score to a class.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=2 => Self::Simple,
            3 => Self::Moderate,
            _ => Self::Complex,
        }
    }
}

impl std::fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Raw content signals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSignals {
    pub char_count: usize,
    pub word_count: usize,
    pub headings: usize,
    pub list_items: usize,
    pub table_rows: usize,
    pub numbered_clauses: usize,
    pub risk_terms: usize,
}

impl ContentSignals {
    /// Extract signals from document text.
    pub fn extract(content: &str) -> Self {
        Self {
            char_count: content.chars().count(),
            word_count: content.split_whitespace().count(),
            headings: HEADING_RE.find_iter(content).count(),
            list_items: LIST_ITEM_RE.find_iter(content).count(),
            table_rows: TABLE_ROW_RE.find_iter(content).count(),
            numbered_clauses: CLAUSE_RE.find_iter(content).count(),
            risk_terms: RISK_VOCAB_RE.find_iter(content).count(),
        }
    }

    /// Total structural markers.
    pub fn structural_markers(&self) -> usize {
        self.headings + self.list_items + self.table_rows + self.numbered_clauses
    }
}

/// Minimum class a task type may be assessed at.
pub fn type_floor(task_type: TaskType) -> ComplexityClass {
    match task_type {
        TaskType::Risk => ComplexityClass::Moderate,
        _ => ComplexityClass::Simple,
    }
}

/// Full assessment result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    pub class: ComplexityClass,
    /// Raw 1-5 score before the type floor
    pub score: u8,
    pub signals: ContentSignals,
    /// Whether the type floor raised the class
    pub floored: bool,
    pub rationale: String,
}

impl ComplexityAssessment {
    /// Get a compact summary for logging
    pub fn summary(&self) -> String {
        format!(
            "complexity={}/5 class={} chars={} markers={}{}",
            self.score,
            self.class,
            self.signals.char_count,
            self.signals.structural_markers(),
            if self.floored { " (floored)" } else { "" }
        )
    }
}

/// Scores content into a complexity class
#[derive(Debug, Clone, Default)]
pub struct ComplexityAssessor {
    config: AssessorConfig,
}

impl ComplexityAssessor {
    pub fn new(config: AssessorConfig) -> Self {
        Self { config }
    }

    /// Assess `content` for `task_type`.
    pub fn assess(&self, content: &str, task_type: TaskType) -> ComplexityAssessment {
        let signals = ContentSignals::extract(content);
        let markers = signals.structural_markers();
        let mut parts = Vec::new();

        let mut score: u8 = 1;
        if signals.char_count > self.config.medium_length_chars {
            score += 1;
            if signals.char_count > self.config.long_length_chars {
                score += 1;
                parts.push(format!("long({} chars)", signals.char_count));
            } else {
                parts.push(format!("medium({} chars)", signals.char_count));
            }
        }
        if markers > self.config.structured_markers {
            score += 1;
            if markers > self.config.dense_markers {
                score += 1;
                parts.push(format!("dense({} markers)", markers));
            } else {
                parts.push(format!("structured({} markers)", markers));
            }
        }
        if signals.risk_terms >= RISK_VOCAB_THRESHOLD {
            score += 1;
            parts.push(format!("risk_terms={}", signals.risk_terms));
        }
        let score = score.min(5);

        let raw = ComplexityClass::from_score(score);
        let floor = type_floor(task_type);
        let class = raw.max(floor);
        let floored = class != raw;

        let mut rationale = format!("complexity={}/5", score);
        if !parts.is_empty() {
            rationale.push_str(&format!(" [{}]", parts.join(", ")));
        }
        if floored {
            rationale.push_str(&format!(", {} floor", task_type));
        }
        rationale.push_str(&format!(" → {}", class));

        ComplexityAssessment {
            class,
            score,
            signals,
            floored,
            rationale,
        }
    }
}
