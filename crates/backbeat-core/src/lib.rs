//! # Backbeat Core
//!
//! Core types, identifiers, and error definitions shared by the Backbeat
//! crates. Storage, configuration, and the job engine all build on the
//! abstractions defined here.

pub mod error;
pub mod id;
pub mod result;
pub mod telemetry;
pub mod validation;

pub use error::*;
pub use id::*;
pub use result::*;
pub use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
pub use validation::*;
