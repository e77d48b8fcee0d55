use thiserror::Error;

/// Error taxonomy for the verification orchestrator.
///
/// Every failure an orchestrator or method workflow can surface maps to
/// exactly one of these kinds. None of them propagate synchronously to a
/// caller: they become audit events and, where user-visible, notifications.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transient storage error: {0}")]
    TransientStorage(String),

    #[error("non-retryable activity error: {0}")]
    NonRetryableActivity(String),
}

impl OrchestratorError {
    /// Whether this error represents a retryable activity failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::TransientStorage(_))
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
