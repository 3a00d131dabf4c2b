//! Result type aliases for Backbeat.

use crate::BackbeatError;

/// A specialized `Result` type for Backbeat operations.
pub type BackbeatResult<T> = Result<T, BackbeatError>;
