//! Unified error types shared across Backbeat crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Infrastructure-level error type for Backbeat.
///
/// Engine-specific failures (leases, handlers, storage) live in the jobs
/// crate; this enum covers what the shared layers run into: bad input and
/// configuration trouble.
#[derive(Error, Debug)]
pub enum BackbeatError {
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Field-level validation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    /// Field name
    pub field: String,
    /// Error message
    pub message: String,
    /// Error code
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = BackbeatError::Validation("tenant_id: must not be blank".into());
        assert_eq!(err.to_string(), "Validation error: tenant_id: must not be blank");
    }

    #[test]
    fn test_configuration_display() {
        let err = BackbeatError::Configuration("jobs.lease.duration_secs: must be positive".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: jobs.lease.duration_secs: must be positive"
        );
    }
}
