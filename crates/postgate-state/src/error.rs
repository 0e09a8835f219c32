//! Error types for postgate-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the persistence backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors produced by the storage traits (`ContentStore`, `JobStore`, ...)
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("text unit not found: {unit_id}")]
    UnitNotFound { unit_id: String },

    #[error("reply job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// A non-terminal reply job already exists for the comment.
    #[error("reply job already active for comment {comment_id}")]
    DuplicateJob { comment_id: String },

    #[error("reply job {job_id} is {status}, expected {expected}")]
    InvalidJobState {
        job_id: String,
        status: String,
        expected: String,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True for the "entity vanished" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::UnitNotFound { .. } | StorageError::JobNotFound { .. }
        )
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
