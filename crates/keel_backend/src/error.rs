//! Error types for the backend module.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors reported by a provisioning backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    Conflict(String),

    #[error("Resource still has dependents: {0}")]
    DependencyViolation(String),

    #[error("Backend internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackendError {
    /// Transient failures that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::Throttled(_) | BackendError::Timeout(_)
        )
    }

    /// Retryable during teardown: a dependent may still be draining.
    pub fn is_retryable_on_delete(&self) -> bool {
        self.is_retryable() || matches!(self, BackendError::DependencyViolation(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(BackendError::Unavailable("503".into()).is_retryable());
        assert!(BackendError::Throttled("rate".into()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BackendError::Rejected("bad".into()).is_retryable());
        assert!(!BackendError::DependencyViolation("sg".into()).is_retryable());
        assert!(BackendError::DependencyViolation("sg".into()).is_retryable_on_delete());
        assert!(!BackendError::NotFound("db".into()).is_retryable_on_delete());
    }
}
