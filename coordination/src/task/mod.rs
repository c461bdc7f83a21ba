//! Task model shared by routing, dispatch and search.

pub mod types;

pub use types::{
    content_hash, PriorityWeights, Task, TaskBuilder, TaskError, TaskId, TaskType,
    DEFAULT_TASK_DEADLINE, WEIGHT_EPSILON,
};
