//! Error types for the scheduler subsystem.

use thiserror::Error;

/// Result type alias for queue and pool operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Result type returned by task bodies and cleanup callbacks.
pub type TaskResult = Result<(), TaskError>;

/// Errors raised by the queue itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedError {
    /// The queue has been closed and accepts no more work.
    #[error("queue is shut down")]
    Shutdown,

    /// `task_done` was called for a key with nothing in flight.
    #[error("task_done called too many times for key {key}")]
    NotInFlight {
        /// Debug rendering of the offending key.
        key: String,
    },
}

/// Outcome classification of a failed task.
///
/// The pool inspects this once per task: a recoverable failure retires the
/// worker and requeues the task, a fatal one aborts the whole process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// Data index connectivity was lost; the task may be retried on a fresh connection.
    #[error("recoverable: {cause}")]
    Recoverable {
        /// Description of the failure.
        cause: String,
    },

    /// Anything else. Data consistency can no longer be trusted.
    #[error("fatal: {cause}")]
    Fatal {
        /// Description of the failure.
        cause: String,
    },
}

impl TaskError {
    /// Builds a recoverable error from anything displayable.
    pub fn recoverable(cause: impl std::fmt::Display) -> Self {
        TaskError::Recoverable {
            cause: cause.to_string(),
        }
    }

    /// Builds a fatal error from anything displayable.
    pub fn fatal(cause: impl std::fmt::Display) -> Self {
        TaskError::Fatal {
            cause: cause.to_string(),
        }
    }

    /// True for the recoverable variant.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaskError::Recoverable { .. })
    }
}

impl From<SchedError> for TaskError {
    fn from(err: SchedError) -> Self {
        TaskError::fatal(err)
    }
}
