//! Dispatch errors

use crate::registry::{AccuracyClass, ModelTier};
use crate::task::TaskId;
use serde::{Deserialize, Serialize};

/// Terminal and per-attempt dispatch failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    /// The caller deadline (or a single attempt's timeout) elapsed
    #[error("Task {task_id} timed out{}", model_suffix(.model))]
    Timeout {
        task_id: TaskId,
        model: Option<String>,
    },

    #[error("Model {model} failed: {reason}")]
    ModelError { model: String, reason: String },

    #[error("Model {model} is rate limited")]
    RateLimited { model: String },

    #[error("No model available from tier {tier} meeting accuracy floor {floor}")]
    NoModelAvailable {
        tier: ModelTier,
        floor: AccuracyClass,
    },

    /// Every retry, fallback and escalation was exhausted
    #[error("Task {task_id} failed after {attempts} attempts: {last}")]
    TaskFailed {
        task_id: TaskId,
        attempts: u32,
        last: Box<DispatchError>,
    },

    #[error("Invalid routing decision: {reason}")]
    InvalidDecision { reason: String },
}

fn model_suffix(model: &Option<String>) -> String {
    model
        .as_ref()
        .map(|m| format!(" on {}", m))
        .unwrap_or_default()
}

impl DispatchError {
    /// Whether resubmitting the task later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::NoModelAvailable { .. } | Self::TaskFailed { .. }
        )
    }

    /// Whether this failure came from the caller deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_nests_last_error() {
        let err = DispatchError::TaskFailed {
            task_id: "t1".into(),
            attempts: 3,
            last: Box::new(DispatchError::RateLimited { model: "m".into() }),
        };
        assert_eq!(
            err.to_string(),
            "Task t1 failed after 3 attempts: Model m is rate limited"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        let err = DispatchError::Timeout {
            task_id: "t1".into(),
            model: Some("m".into()),
        };
        assert_eq!(err.to_string(), "Task t1 timed out on m");
        assert!(err.is_timeout());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let err = DispatchError::InvalidDecision {
            reason: "cache hit without value".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "invalid_decision");
        let back: DispatchError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
