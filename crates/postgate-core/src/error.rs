//! Error taxonomy for postgate.

use postgate_state::StorageError;

/// Failures at the classifier/generator boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// Timeout or transport failure. Transient; callers may retry.
    #[error("{gateway} unavailable: {reason}")]
    UpstreamUnavailable {
        gateway: &'static str,
        reason: String,
    },

    /// Well-formed refusal (quota, invalid input). Permanent.
    #[error("{gateway} rejected the request: {reason}")]
    UpstreamRejected {
        gateway: &'static str,
        reason: String,
    },
}

impl GatewayError {
    pub fn unavailable(gateway: &'static str, reason: impl Into<String>) -> Self {
        GatewayError::UpstreamUnavailable {
            gateway,
            reason: reason.into(),
        }
    }

    pub fn rejected(gateway: &'static str, reason: impl Into<String>) -> Self {
        GatewayError::UpstreamRejected {
            gateway,
            reason: reason.into(),
        }
    }

    /// Only `UpstreamUnavailable` is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::UpstreamUnavailable { .. })
    }
}

/// postgate domain errors.
#[derive(Debug, thiserror::Error)]
pub enum PostgateError {
    #[error("reply job already active for comment {comment_id}")]
    DuplicateJob { comment_id: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("unauthenticated caller")]
    Unauthenticated,

    #[error("caller {author_id} may not modify unit {unit_id}")]
    Forbidden { author_id: String, unit_id: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for PostgateError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateJob { comment_id } => PostgateError::DuplicateJob { comment_id },
            StorageError::UnitNotFound { unit_id } => PostgateError::NotFound {
                what: "text unit",
                id: unit_id,
            },
            StorageError::JobNotFound { job_id } => PostgateError::NotFound {
                what: "reply job",
                id: job_id,
            },
            other => PostgateError::Storage(other),
        }
    }
}

/// Result type for postgate operations.
pub type Result<T> = std::result::Result<T, PostgateError>;
