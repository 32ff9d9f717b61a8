//! Error types for the archive subsystem.

use hoardfs_sched::{SchedError, TaskError};
use thiserror::Error;

/// Result type alias for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Result type alias for data index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors reported by the data index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    /// The connection to the index was lost. Work may be retried on a new connection.
    #[error("data index connection lost: {0}")]
    ConnectionLost(String),

    /// A record lookup found nothing.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Record type, e.g. "node".
        kind: &'static str,
        /// Lookup key.
        key: String,
    },

    /// A write violated a uniqueness or reference constraint.
    #[error("constraint violated: {0}")]
    Constraint(String),
}

impl IndexError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        IndexError::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

/// Errors raised by controllers, transitions and the daemon.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Wraps data index errors.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps queue errors.
    #[error("scheduler error: {0}")]
    Sched(#[from] SchedError),

    /// No I/O class is registered under this name.
    #[error("unknown I/O class: {name}")]
    UnknownIoClass {
        /// The requested class name.
        name: String,
    },

    /// The I/O configuration of a node or group is unusable.
    #[error("invalid I/O config for {target}: {reason}")]
    InvalidIoConfig {
        /// Node or group name.
        target: String,
        /// What is wrong.
        reason: String,
    },

    /// A group was given a node set its I/O class cannot manage.
    #[error("invalid node set for group {group}: {reason}")]
    InvalidGroup {
        /// Group name.
        group: String,
        /// What is wrong.
        reason: String,
    },

    /// More bytes were released than were reserved on a node.
    #[error("release of {requested} bytes on {node} exceeds reservation of {reserved} bytes")]
    OverRelease {
        /// Node name.
        node: String,
        /// Bytes requested for release.
        requested: u64,
        /// Bytes currently reserved.
        reserved: u64,
    },

    /// Configuration file problem.
    #[error("config error: {0}")]
    Config(String),

    /// The pool aborted after a fatal task error.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl From<IndexError> for TaskError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::ConnectionLost(cause) => TaskError::Recoverable { cause },
            other => TaskError::fatal(other),
        }
    }
}

impl From<ArchiveError> for TaskError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Index(inner) => inner.into(),
            other => TaskError::fatal(other),
        }
    }
}
