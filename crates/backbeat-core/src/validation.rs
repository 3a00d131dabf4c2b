//! Validation utilities.

use crate::{BackbeatError, FieldError};
use validator::{Validate, ValidationErrors};

/// Extension trait for validation.
pub trait ValidateExt: Validate {
    /// Validates the struct and returns a `BackbeatError` on failure.
    fn validate_request(&self) -> Result<(), BackbeatError> {
        self.validate().map_err(validation_errors_to_backbeat_error)
    }
}

impl<T: Validate> ValidateExt for T {}

/// Converts `validator::ValidationErrors` to `BackbeatError`.
#[must_use]
pub fn validation_errors_to_backbeat_error(errors: ValidationErrors) -> BackbeatError {
    let mut field_errors: Vec<FieldError> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |error| FieldError {
                field: (*field).to_string(),
                message: error
                    .message
                    .as_ref()
                    .map_or_else(|| error.code.to_string(), |m| m.to_string()),
                code: error.code.to_string(),
            })
        })
        .collect();

    // HashMap iteration order is not stable
    field_errors.sort_by(|a, b| a.field.cmp(&b.field));

    let message = field_errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ");

    BackbeatError::Validation(message)
}

/// Common validation functions.
pub mod rules {
    use validator::ValidationError;

    /// Validates that a string is not blank (not empty after trimming).
    pub fn not_blank(value: &str) -> Result<(), ValidationError> {
        if value.trim().is_empty() {
            return Err(ValidationError::new("not_blank"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Validate)]
    struct Sample {
        #[validate(custom(function = "rules::not_blank", message = "tenant must not be blank"))]
        tenant: String,
        #[validate(range(min = 1, message = "must be at least 1"))]
        count: u32,
    }

    #[test]
    fn test_not_blank_rule() {
        assert!(rules::not_blank("t1").is_ok());
        assert!(rules::not_blank("").is_err());
        assert!(rules::not_blank("   ").is_err());
    }

    #[test]
    fn test_validate_request_collects_field_messages() {
        let sample = Sample {
            tenant: " ".to_string(),
            count: 0,
        };
        let err = sample.validate_request().unwrap_err();
        match err {
            BackbeatError::Validation(msg) => {
                assert_eq!(msg, "count: must be at least 1; tenant: tenant must not be blank");
            }
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_request_passes() {
        let sample = Sample {
            tenant: "t1".to_string(),
            count: 3,
        };
        assert!(sample.validate_request().is_ok());
    }
}
