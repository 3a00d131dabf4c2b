//! Job error types.

use backbeat_core::BackbeatError;
use std::time::Duration;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed enqueue input. Never reaches the store.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient store failure; callers should retry with backoff.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// No handler is registered for the job type.
    #[error("UnknownJobType: {0}")]
    UnknownJobType(String),

    /// A handler returned an error. Retried while attempts remain.
    #[error("{0}")]
    Handler(String),

    /// A handler failure that retrying cannot fix.
    #[error("{0}")]
    Fatal(String),

    /// The caller no longer holds the lease on the job.
    #[error("Lease lost on job {0}")]
    LeaseLost(String),

    /// The handler exceeded its execution budget.
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Creates a retryable handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        JobError::Handler(message.into())
    }

    /// Creates a terminal handler failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        JobError::Fatal(message.into())
    }

    /// Returns true if a job failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Handler(_)
                | JobError::Timeout(_)
                | JobError::StoreUnavailable(_)
                | JobError::Internal(_)
        )
    }

    /// Text recorded in the job's `last_error` column.
    ///
    /// Unknown types record the bare error kind; the type name is already on
    /// the job row.
    pub fn last_error(&self) -> String {
        match self {
            JobError::UnknownJobType(_) => "UnknownJobType".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<BackbeatError> for JobError {
    fn from(err: BackbeatError) -> Self {
        match err {
            BackbeatError::Validation(msg) => JobError::Validation(msg),
            BackbeatError::Configuration(msg) => JobError::Configuration(msg),
            BackbeatError::Internal(msg) => JobError::Internal(msg),
        }
    }
}

/// Lets handlers built on `anyhow` use `?`. The failure is retryable and the
/// full context chain becomes `last_error`.
impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Handler(format!("{err:#}"))
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => {
                JobError::Internal(format!("Row decode error: {err}"))
            }
            _ => JobError::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for JobError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        JobError::StoreUnavailable(format!("Migration failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_handler() {
        assert!(JobError::handler("render error").is_retryable());
    }

    #[test]
    fn test_is_retryable_timeout() {
        assert!(JobError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn test_is_not_retryable_unknown_type() {
        assert!(!JobError::UnknownJobType("unregistered_type".into()).is_retryable());
    }

    #[test]
    fn test_is_not_retryable_fatal() {
        assert!(!JobError::fatal("bad payload").is_retryable());
    }

    #[test]
    fn test_is_not_retryable_validation() {
        assert!(!JobError::Validation("tenant_id: must not be blank".into()).is_retryable());
    }

    #[test]
    fn test_last_error_keeps_handler_message_verbatim() {
        assert_eq!(JobError::handler("render error").last_error(), "render error");
    }

    #[test]
    fn test_last_error_for_unknown_type_is_the_error_kind() {
        let err = JobError::UnknownJobType("unregistered_type".into());
        assert_eq!(err.last_error(), "UnknownJobType");
        assert_eq!(err.to_string(), "UnknownJobType: unregistered_type");
    }

    #[test]
    fn test_from_backbeat_validation_error() {
        let err = JobError::from(BackbeatError::Validation("job_type: must not be blank".into()));
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn test_from_backbeat_configuration_error() {
        let err = JobError::from(BackbeatError::Configuration("bad url".into()));
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[test]
    fn test_from_anyhow_keeps_context_chain() {
        let err = JobError::from(
            anyhow::anyhow!("connection refused").context("encoder unavailable"),
        );
        assert!(err.is_retryable());
        assert_eq!(err.last_error(), "encoder unavailable: connection refused");
    }

    #[test]
    fn test_from_sqlx_pool_timeout() {
        let err = JobError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, JobError::StoreUnavailable(_)));
    }

    #[test]
    fn test_error_display_timeout() {
        assert_eq!(
            JobError::Timeout(Duration::from_millis(1500)).to_string(),
            "Handler timed out after 1.5s"
        );
    }
}
