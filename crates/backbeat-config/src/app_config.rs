//! Application configuration structures.

use backbeat_core::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Job store connection.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Job engine tuning.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Logging and tracing.
    #[serde(default)]
    pub observability: TelemetryConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "backbeat".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Database configuration.
///
/// The URL scheme selects the job store: `sqlite:`, `postgres:` /
/// `postgresql:`, or the literal `memory` for a process-local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL.
    pub url: String,
    /// Minimum connection pool size.
    pub min_connections: u32,
    /// Maximum connection pool size.
    pub max_connections: u32,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Idle timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Apply embedded migrations on connect.
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://backbeat.db?mode=rwc".to_string(),
            min_connections: 1,
            max_connections: 10,
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    /// Returns the connect timeout as a Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns the idle timeout as a Duration.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Returns the store backend named by the URL.
    #[must_use]
    pub fn backend(&self) -> Option<StoreBackend> {
        if self.url == "memory" {
            Some(StoreBackend::Memory)
        } else if self.url.starts_with("sqlite:") {
            Some(StoreBackend::Sqlite)
        } else if self.url.starts_with("postgres://") || self.url.starts_with("postgresql://") {
            Some(StoreBackend::Postgres)
        } else {
            None
        }
    }
}

/// Job store backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store, lost on restart.
    Memory,
    /// SQLite database file.
    Sqlite,
    /// PostgreSQL server.
    Postgres,
}

/// Configuration for the job engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Attempts granted to a job when the producer does not specify any.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Lease configuration.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Retry backoff configuration.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            lease: LeaseConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

/// Lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a claim stays exclusive before it becomes reclaimable.
    #[serde(default = "default_lease_duration")]
    pub duration_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_lease_duration(),
        }
    }
}

fn default_lease_duration() -> u64 {
    60
}

impl LeaseConfig {
    /// Returns the lease duration as Duration.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of independent claim/execute/report slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sleep between empty polls in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Seconds a handler may run without renewing its lease before it is
    /// aborted. Each renewal restarts the clock. `0` disables the limit.
    #[serde(default)]
    pub handler_timeout_secs: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Minimum spacing between expired-lease sweeps in milliseconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,

    /// Job types this pool claims. Empty means every type.
    #[serde(default)]
    pub job_types: Vec<String>,

    /// Prefix for generated worker identities.
    #[serde(default = "default_identity_prefix")]
    pub identity_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            handler_timeout_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout(),
            reap_interval_ms: default_reap_interval(),
            job_types: Vec::new(),
            identity_prefix: default_identity_prefix(),
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .min(8)
}

fn default_poll_interval() -> u64 {
    500
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_reap_interval() -> u64 {
    10_000
}

fn default_identity_prefix() -> String {
    "backbeat-worker".to_string()
}

impl WorkerConfig {
    /// Returns poll interval as Duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns handler timeout as Duration.
    #[must_use]
    pub const fn handler_timeout(&self) -> Option<Duration> {
        if self.handler_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.handler_timeout_secs))
        }
    }

    /// Returns shutdown timeout as Duration.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Returns reap interval as Duration.
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Backoff strategy applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Failed jobs are immediately claimable again.
    #[default]
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff with optional jitter.
    Exponential,
    /// Linear backoff.
    Linear,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff strategy.
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random jitter as a fraction of the delay (0.0 to 1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_initial_delay() -> u64 {
    1000 // 1 second
}

fn default_max_delay() -> u64 {
    600_000 // 10 minutes
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.default_max_attempts, 5);
        assert_eq!(config.lease.duration(), Duration::from_secs(60));
        assert_eq!(config.retry.strategy, BackoffStrategy::None);
        assert_eq!(config.worker.handler_timeout(), None);
        assert!(config.worker.concurrency >= 1);
    }

    #[test]
    fn test_store_backend_from_url() {
        let mut db = DatabaseConfig::default();
        assert_eq!(db.backend(), Some(StoreBackend::Sqlite));

        db.url = "postgres://backbeat@localhost/backbeat".to_string();
        assert_eq!(db.backend(), Some(StoreBackend::Postgres));

        db.url = "memory".to_string();
        assert_eq!(db.backend(), Some(StoreBackend::Memory));

        db.url = "mysql://localhost/backbeat".to_string();
        assert_eq!(db.backend(), None);
    }

    #[test]
    fn test_backoff_strategy_serde_names() {
        let retry: RetryConfig = serde_json::from_str(r#"{"strategy": "exponential"}"#).unwrap();
        assert_eq!(retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(retry.initial_delay_ms, 1000);
    }
}
