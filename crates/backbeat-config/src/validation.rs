//! Configuration validation module.
//!
//! Rejects unusable engine settings at startup instead of letting a worker
//! discover them mid-run.

use crate::{AppConfig, BackoffStrategy, JobsConfig, StoreBackend};
use backbeat_core::TelemetryConfig;
use std::fmt;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// A count that must be at least one was zero.
    ZeroCount { name: String },
    /// Timeout or interval value must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// A job type filter entry is blank.
    BlankJobType,
    /// Pool size configuration is invalid (min must be <= max).
    InvalidPoolSize { min: u32, max: u32 },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: u32, maximum: u32 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Jitter factor must be between 0.0 and 1.0.
    InvalidJitterFactor { value: f64 },
    /// Exponential backoff needs a multiplier of at least 1.0.
    InvalidMultiplier { value: f64 },
    /// Retry delay bounds are inverted.
    InvalidDelayBounds { initial_ms: u64, max_ms: u64 },
    /// Sampling ratio must be between 0.0 and 1.0.
    InvalidSamplingRatio { value: f64 },
    /// Log level is invalid.
    InvalidLogLevel { value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroCount { name } => write!(f, "'{}' must be at least 1", name),
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::BlankJobType => write!(f, "Worker job type filter contains a blank entry"),
            Self::InvalidPoolSize { min, max } => {
                write!(
                    f,
                    "Invalid pool size: min ({}) cannot be greater than max ({})",
                    min, max
                )
            }
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(
                    f,
                    "Pool size {} exceeds maximum allowed ({})",
                    value, maximum
                )
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::InvalidJitterFactor { value } => {
                write!(
                    f,
                    "Invalid jitter factor: {} (must be between 0.0 and 1.0)",
                    value
                )
            }
            Self::InvalidMultiplier { value } => {
                write!(f, "Invalid backoff multiplier: {} (must be >= 1.0)", value)
            }
            Self::InvalidDelayBounds { initial_ms, max_ms } => {
                write!(
                    f,
                    "Retry initial delay ({}ms) cannot exceed max delay ({}ms)",
                    initial_ms, max_ms
                )
            }
            Self::InvalidSamplingRatio { value } => {
                write!(
                    f,
                    "Invalid sampling ratio: {} (must be between 0.0 and 1.0)",
                    value
                )
            }
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{}' (valid: off, trace, debug, info, warn, error)",
                    value
                )
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    fn require_positive(&mut self, name: &str, value: u64) {
        if value == 0 {
            self.add_error(ConfigValidationError::NonPositiveTimeout {
                name: name.to_string(),
                value,
            });
        }
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: u32 = 1000;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();

        Self::validate_database(&config.database, &mut result);
        Self::validate_jobs(&config.jobs, &mut result);
        Self::validate_observability(&config.observability, &mut result);

        result.into_result()
    }

    fn validate_database(config: &crate::DatabaseConfig, result: &mut ValidationResult) {
        match config.backend() {
            Some(StoreBackend::Memory) => return,
            Some(_) => {
                if let Err(e) = Url::parse(&config.url) {
                    result.add_error(ConfigValidationError::InvalidUrl {
                        url_type: "database".to_string(),
                        message: e.to_string(),
                    });
                }
            }
            None => {
                result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "database".to_string(),
                    message: "URL must be `memory` or start with sqlite:, postgres:// or postgresql://"
                        .to_string(),
                });
            }
        }

        if config.max_connections == 0 {
            result.add_error(ConfigValidationError::ZeroCount {
                name: "database.max_connections".to_string(),
            });
        }
        if config.min_connections > config.max_connections {
            result.add_error(ConfigValidationError::InvalidPoolSize {
                min: config.min_connections,
                max: config.max_connections,
            });
        }
        if config.max_connections > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: config.max_connections,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        result.require_positive("database.connect_timeout_secs", config.connect_timeout_secs);
        result.require_positive("database.idle_timeout_secs", config.idle_timeout_secs);
    }

    fn validate_jobs(config: &JobsConfig, result: &mut ValidationResult) {
        if config.default_max_attempts == 0 {
            result.add_error(ConfigValidationError::ZeroCount {
                name: "jobs.default_max_attempts".to_string(),
            });
        }

        result.require_positive("jobs.lease.duration_secs", config.lease.duration_secs);

        let worker = &config.worker;
        if worker.concurrency == 0 {
            result.add_error(ConfigValidationError::ZeroCount {
                name: "jobs.worker.concurrency".to_string(),
            });
        }
        result.require_positive("jobs.worker.poll_interval_ms", worker.poll_interval_ms);
        result.require_positive("jobs.worker.shutdown_timeout_secs", worker.shutdown_timeout_secs);
        result.require_positive("jobs.worker.reap_interval_ms", worker.reap_interval_ms);

        if worker.job_types.iter().any(|t| t.trim().is_empty()) {
            result.add_error(ConfigValidationError::BlankJobType);
        }

        let retry = &config.retry;
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            result.add_error(ConfigValidationError::InvalidJitterFactor {
                value: retry.jitter_factor,
            });
        }
        if retry.strategy == BackoffStrategy::Exponential && !(retry.multiplier >= 1.0) {
            result.add_error(ConfigValidationError::InvalidMultiplier {
                value: retry.multiplier,
            });
        }
        if retry.strategy != BackoffStrategy::None && retry.initial_delay_ms > retry.max_delay_ms {
            result.add_error(ConfigValidationError::InvalidDelayBounds {
                initial_ms: retry.initial_delay_ms,
                max_ms: retry.max_delay_ms,
            });
        }
    }

    fn validate_observability(config: &TelemetryConfig, result: &mut ValidationResult) {
        // Directives look like `info` or `backbeat=debug`; a bare target is also legal.
        let bad_level = config.log_level.split(',').any(|directive| {
            let directive = directive.trim();
            match directive.rsplit_once('=') {
                Some((_, level)) => LevelFilter::from_str(level).is_err(),
                None => directive.is_empty(),
            }
        });
        if bad_level {
            result.add_error(ConfigValidationError::InvalidLogLevel {
                value: config.log_level.clone(),
            });
        }

        if !(0.0..=1.0).contains(&config.sampling_ratio) {
            result.add_error(ConfigValidationError::InvalidSamplingRatio {
                value: config.sampling_ratio,
            });
        }

        if let Some(ref endpoint) = config.otlp_endpoint {
            if Url::parse(endpoint).is_err() {
                result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "otlp_endpoint".to_string(),
                    message: format!("Invalid URL format: {}", endpoint),
                });
            }
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
