//! Error types for the scheduler.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::InvalidTransition;
use crate::{JobId, JobStatus};

/// Errors from the job store and attempt log backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during file operations.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error serializing a record.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error deserializing file contents.
    #[error("deserialization error at {path}: {message}")]
    Deserialization { path: PathBuf, message: String },

    /// A file lock could not be taken.
    #[error("failed to lock {path}: {message}")]
    Lock { path: PathBuf, message: String },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn deserialization(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Deserialization {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Job already exists.
    #[error("job already exists: {0}")]
    JobExists(JobId),

    /// The job was rejected at creation time.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Cancellation is only possible before dispatch starts.
    #[error("job {id} cannot be cancelled while {status}")]
    CancelRefused { id: JobId, status: JobStatus },

    /// Terminal jobs are immutable.
    #[error("job {id} is already {status}")]
    JobFinalized { id: JobId, status: JobStatus },

    /// Optimistic-concurrency clash on save.
    #[error("store conflict on job {id}: expected version {expected}, found {found}")]
    StoreConflict { id: JobId, expected: u64, found: u64 },

    /// A state machine transition was rejected.
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The job store could not be read; the loop backs off before the next tick.
    #[error("job store unavailable: {0}")]
    LoopFatal(String),
}
