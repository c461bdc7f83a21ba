//! Core task types
//!
//! A [`Task`] is created once per incoming request, flows through the
//! router and dispatcher, and is dropped when the caller has its result.
//! Nothing in this module mutates a task after construction.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Unique identifier for a task invocation
pub type TaskId = String;

/// Tolerance applied when checking that priority weights sum to one.
pub const WEIGHT_EPSILON: f64 = 1e-3;

/// Errors raised while building tasks from caller input
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid priority weights: {0}")]
    InvalidWeights(String),

    #[error("Empty input for {task_type} task on document {doc_id}")]
    EmptyInput { task_type: TaskType, doc_id: String },
}

/// Kinds of work the layer knows how to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Condensed overview of a document
    Summary,
    /// Extracted follow-ups and owners
    ActionItems,
    /// Risk and liability assessment
    Risk,
    /// Question answering against the document
    Qa,
    /// Vector embedding of the document
    Embedding,
    /// Hybrid search over already-retrieved ranked lists
    Search,
}

impl TaskType {
    /// Every task type, in wire-name order.
    pub fn all() -> &'static [TaskType] {
        &[
            TaskType::Summary,
            TaskType::ActionItems,
            TaskType::Risk,
            TaskType::Qa,
            TaskType::Embedding,
            TaskType::Search,
        ]
    }

    /// Snake-case name used on the wire and in cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::ActionItems => "action_items",
            Self::Risk => "risk",
            Self::Qa => "qa",
            Self::Embedding => "embedding",
            Self::Search => "search",
        }
    }

    /// Results that are intermediates of a search merge and go stale quickly.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Search)
    }

    /// Whether a backend model has to be called to produce the result.
    pub fn requires_model(&self) -> bool {
        !matches!(self, Self::Search)
    }

    /// Default response budget for the backend call.
    pub fn default_max_tokens(&self) -> u32 {
        match self {
            Self::Summary => 1024,
            Self::ActionItems => 768,
            Self::Risk => 1536,
            Self::Qa => 512,
            Self::Embedding => 256,
            Self::Search => 0,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        TaskType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| TaskError::UnknownTaskType(s.to_string()))
    }
}

/// Caller priority between cost, speed and accuracy.
///
/// Always sums to one within [`WEIGHT_EPSILON`]. Malformed weights are
/// rejected at construction, never normalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriorityWeights {
    cost: f64,
    speed: f64,
    accuracy: f64,
}

impl PriorityWeights {
    /// Validate and build a weight vector.
    pub fn new(cost: f64, speed: f64, accuracy: f64) -> Result<Self, TaskError> {
        for (name, value) in [("cost", cost), ("speed", speed), ("accuracy", accuracy)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(TaskError::InvalidWeights(format!(
                    "{} weight {} is outside [0, 1]",
                    name, value
                )));
            }
        }
        let sum = cost + speed + accuracy;
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(TaskError::InvalidWeights(format!(
                "weights sum to {:.4}, expected 1.0",
                sum
            )));
        }
        Ok(Self {
            cost,
            speed,
            accuracy,
        })
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    /// Speed outranks cost when ordering models inside a tier.
    pub fn prefers_latency(&self) -> bool {
        self.speed > self.cost
    }
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            cost: 0.34,
            speed: 0.33,
            accuracy: 0.33,
        }
    }
}

// Deserialization goes through `new` so the sum invariant holds for
// weights that arrive from config files or RPC payloads too.
impl<'de> Deserialize<'de> for PriorityWeights {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            cost: f64,
            speed: f64,
            accuracy: f64,
        }
        let raw = Raw::deserialize(deserializer)?;
        PriorityWeights::new(raw.cost, raw.speed, raw.accuracy).map_err(serde::de::Error::custom)
    }
}

/// Canonical blake3 hex digest of document content.
pub fn content_hash(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

/// A single unit of routed work.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    task_type: TaskType,
    org_id: String,
    doc_id: String,
    content: Arc<str>,
    content_hash: String,
    weights: PriorityWeights,
    deadline: Instant,
    question: Option<String>,
}

impl Task {
    /// Start building a task for a document.
    pub fn builder(
        task_type: TaskType,
        org_id: impl Into<String>,
        doc_id: impl Into<String>,
        content: Arc<str>,
    ) -> TaskBuilder {
        TaskBuilder {
            task_type,
            org_id: org_id.into(),
            doc_id: doc_id.into(),
            content,
            content_hash: None,
            weights: PriorityWeights::default(),
            deadline: None,
            question: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn weights(&self) -> &PriorityWeights {
        &self.weights
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn question(&self) -> Option<&str> {
        self.question.as_deref()
    }

    /// Hash of every input the task's output depends on besides its type.
    ///
    /// The content hash alone, except for a `qa` task with a question,
    /// where the question is folded in.
    pub fn input_hash(&self) -> String {
        match (self.task_type, self.question.as_deref()) {
            (TaskType::Qa, Some(question)) => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(self.content_hash.as_bytes());
                hasher.update(&[0x1f]);
                hasher.update(question.as_bytes());
                hasher.finalize().to_hex().to_string()
            }
            _ => self.content_hash.clone(),
        }
    }

    /// Time left before the caller deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Compact summary for logging
    pub fn summary(&self) -> String {
        format!(
            "task={} type={} org={} doc={} hash={}",
            self.id,
            self.task_type,
            self.org_id,
            self.doc_id,
            self.content_hash.chars().take(12).collect::<String>()
        )
    }
}

/// Builder for [`Task`].
#[derive(Debug)]
pub struct TaskBuilder {
    task_type: TaskType,
    org_id: String,
    doc_id: String,
    content: Arc<str>,
    content_hash: Option<String>,
    weights: PriorityWeights,
    deadline: Option<Instant>,
    question: Option<String>,
}

/// Deadline applied when the caller supplies none.
pub const DEFAULT_TASK_DEADLINE: Duration = Duration::from_secs(120);

impl TaskBuilder {
    /// Use a hash supplied by the document collaborator.
    pub fn content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn weights(mut self, weights: PriorityWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    pub fn build(self) -> Task {
        let content_hash = self
            .content_hash
            .unwrap_or_else(|| content_hash(self.content.as_bytes()));
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: self.task_type,
            org_id: self.org_id,
            doc_id: self.doc_id,
            content: self.content,
            content_hash,
            weights: self.weights,
            deadline: self
                .deadline
                .unwrap_or_else(|| Instant::now() + DEFAULT_TASK_DEADLINE),
            question: self.question,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_round_trips_wire_names() {
        for t in TaskType::all() {
            assert_eq!(t.as_str().parse::<TaskType>().unwrap(), *t);
        }
        assert_eq!(" Action_Items ".parse::<TaskType>().unwrap(), TaskType::ActionItems);
    }

    #[test]
    fn test_unknown_task_type_rejected() {
        let err = "translate".parse::<TaskType>().unwrap_err();
        assert_eq!(err, TaskError::UnknownTaskType("translate".to_string()));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(PriorityWeights::new(0.8, 0.1, 0.1).is_ok());
        assert!(PriorityWeights::new(0.5, 0.2, 0.2).is_err());
        assert!(PriorityWeights::new(0.3334, 0.3333, 0.3333).is_ok());
    }

    #[test]
    fn test_weights_reject_out_of_range() {
        assert!(PriorityWeights::new(1.2, -0.1, -0.1).is_err());
        assert!(PriorityWeights::new(f64::NAN, 0.5, 0.5).is_err());
    }

    #[test]
    fn test_weights_deserialize_validates() {
        let ok: PriorityWeights =
            serde_json::from_str(r#"{"cost":0.2,"speed":0.2,"accuracy":0.6}"#).unwrap();
        assert_eq!(ok.accuracy(), 0.6);

        let bad = serde_json::from_str::<PriorityWeights>(r#"{"cost":0.9,"speed":0.9,"accuracy":0.9}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_builder_hashes_content_when_missing() {
        let content: Arc<str> = Arc::from("quarterly report");
        let task = Task::builder(TaskType::Summary, "org-1", "doc-1", content.clone()).build();
        assert_eq!(task.content_hash(), content_hash(b"quarterly report"));

        let task = Task::builder(TaskType::Summary, "org-1", "doc-1", content)
            .content_hash("abc")
            .build();
        assert_eq!(task.content_hash(), "abc");
    }

    #[test]
    fn test_input_hash_folds_in_qa_question() {
        let content: Arc<str> = Arc::from("renewal terms");
        let qa = |question: &str| {
            Task::builder(TaskType::Qa, "o", "d", content.clone())
                .question(question)
                .build()
                .input_hash()
        };
        assert_ne!(qa("When is renewal due?"), qa("What is the price?"));
        assert_eq!(qa("What is the price?"), qa("What is the price?"));

        let bare = Task::builder(TaskType::Qa, "o", "d", content.clone()).build();
        assert_eq!(bare.input_hash(), content_hash(b"renewal terms"));
        // Other types ignore a stray question.
        let summary = Task::builder(TaskType::Summary, "o", "d", content)
            .question("ignored")
            .build();
        assert_eq!(summary.input_hash(), summary.content_hash());
    }

    #[test]
    fn test_summary_truncates_hash_on_char_boundary() {
        let task = Task::builder(TaskType::Summary, "o", "d", Arc::from("x"))
            .content_hash("ééééééééééééééé")
            .build();
        assert!(task.summary().ends_with("hash=éééééééééééé"));
    }

    #[test]
    fn test_each_task_gets_unique_id() {
        let content: Arc<str> = Arc::from("x");
        let a = Task::builder(TaskType::Qa, "o", "d", content.clone()).build();
        let b = Task::builder(TaskType::Qa, "o", "d", content).build();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_search_is_the_only_ephemeral_type() {
        let ephemeral: Vec<_> = TaskType::all().iter().filter(|t| t.is_ephemeral()).collect();
        assert_eq!(ephemeral, vec![&TaskType::Search]);
        assert!(!TaskType::Search.requires_model());
    }
}
