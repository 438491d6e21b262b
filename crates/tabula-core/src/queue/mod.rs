//! Queue module: task queue, lease, and the shared backoff policy.

mod memory;
mod retry;

pub use memory::{TaskLease, TaskQueue};
pub use retry::RetryPolicy;

use crate::domain::{InvalidTransition, TaskId};

/// Failure reporting a task result back to the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}
