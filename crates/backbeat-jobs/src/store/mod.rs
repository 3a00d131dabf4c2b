//! Durable job record storage.
//!
//! Every method is a single atomic operation against the backing store.
//! Callers pass `now` explicitly so that eligibility and expiry are decided
//! by the engine's [`Clock`](crate::clock::Clock), never by the database.

mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;
pub use sqlite::SqliteJobStore;

use crate::error::{JobError, JobResult};
use crate::job::{ClaimFilter, Job, JobId, JobQuery, JobStatus, NewJobRecord, StatusCounts, TenantId, WorkerId};
use async_trait::async_trait;
use backbeat_config::{DatabaseConfig, StoreBackend};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

/// `last_error` written by the reaper.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// Shared store handle.
pub type SharedJobStore = Arc<dyn JobStore>;

/// A successful claim, with the status the row had before it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    /// `Processing` when an expired lease was taken over.
    pub previous_status: JobStatus,
}

/// Identifies the lease an outcome is reported under.
///
/// A transition only applies while the row is still `processing`, owned by
/// `worker`, at the same attempt count. Any reclaim changes one of those.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    pub worker: WorkerId,
    pub attempts: u32,
}

/// Outcome write applied to a leased job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Handler succeeded.
    Complete,
    /// Back to `pending`, optionally not claimable before `not_before_at`.
    Retry {
        error: String,
        not_before_at: Option<DateTime<Utc>>,
    },
    /// Terminal failure.
    Fail { error: String },
}

impl Transition {
    /// Status the job ends up in.
    pub fn target_status(&self) -> JobStatus {
        match self {
            Transition::Complete => JobStatus::Completed,
            Transition::Retry { .. } => JobStatus::Pending,
            Transition::Fail { .. } => JobStatus::Failed,
        }
    }

    /// New `last_error`, if this transition records one.
    pub fn error(&self) -> Option<&str> {
        match self {
            Transition::Complete => None,
            Transition::Retry { error, .. } | Transition::Fail { error } => Some(error),
        }
    }

    /// New `not_before_at`.
    pub fn not_before_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Transition::Retry { not_before_at, .. } => *not_before_at,
            Transition::Complete | Transition::Fail { .. } => None,
        }
    }

    /// Applies the transition to an in-memory record.
    pub(crate) fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        job.status = self.target_status();
        if let Some(error) = self.error() {
            job.last_error = Some(error.to_string());
        }
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.not_before_at = self.not_before_at();
        job.updated_at = now;
    }
}

/// Storage backend for job records.
#[async_trait]
pub trait JobStore: Send + Sync + Debug {
    /// Inserts a new `pending` job.
    async fn insert(&self, job: NewJobRecord) -> JobResult<Job>;

    /// Atomically claims the oldest eligible job matching `filter`.
    ///
    /// The claimed row becomes `processing`, owned by `worker` until
    /// `lease_until`, with `attempts` incremented.
    async fn claim(
        &self,
        filter: &ClaimFilter,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<ClaimedJob>>;

    /// Applies `update` if `guard` still describes the current lease.
    ///
    /// `None` means the write was rejected.
    async fn transition(
        &self,
        id: JobId,
        guard: &LeaseGuard,
        update: Transition,
        now: DateTime<Utc>,
    ) -> JobResult<Option<Job>>;

    /// Pushes the lease expiry out to `lease_until` if `worker` still owns it.
    async fn renew(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<DateTime<Utc>>>;

    /// Fails processing jobs whose lease expired with no attempts left.
    async fn reap_expired(&self, now: DateTime<Utc>) -> JobResult<Vec<Job>>;

    /// Looks a job up by id across all tenants. Engine-internal.
    async fn find(&self, id: JobId) -> JobResult<Option<Job>>;

    /// Looks a job up within one tenant.
    async fn get(&self, tenant: &TenantId, id: JobId) -> JobResult<Option<Job>>;

    /// Lists a tenant's jobs, oldest first.
    async fn list(&self, tenant: &TenantId, query: &JobQuery) -> JobResult<Vec<Job>>;

    /// Counts a tenant's jobs per status.
    async fn count_by_status(&self, tenant: &TenantId) -> JobResult<StatusCounts>;

    /// Creates or upgrades the schema.
    async fn migrate(&self) -> JobResult<()> {
        Ok(())
    }
}

/// Opens the store named by `config.url`.
pub async fn connect_store(config: &DatabaseConfig) -> JobResult<SharedJobStore> {
    let store: SharedJobStore = match config.backend() {
        Some(StoreBackend::Memory) => {
            info!("Using in-memory job store");
            Arc::new(MemoryJobStore::new())
        }
        Some(StoreBackend::Sqlite) => Arc::new(SqliteJobStore::connect(config).await?),
        Some(StoreBackend::Postgres) => Arc::new(PostgresJobStore::connect(config).await?),
        None => {
            return Err(JobError::Configuration(format!(
                "Unsupported database URL: {}",
                config.url
            )))
        }
    };

    if config.run_migrations {
        store.migrate().await?;
    }

    Ok(store)
}

pub(crate) fn millis_to_datetime(millis: i64) -> JobResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| JobError::Internal(format!("Timestamp out of range: {millis}")))
}

pub(crate) fn to_u32(value: i64, column: &str) -> JobResult<u32> {
    u32::try_from(value)
        .map_err(|_| JobError::Internal(format!("Invalid {column} in database: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_targets() {
        assert_eq!(Transition::Complete.target_status(), JobStatus::Completed);
        let retry = Transition::Retry {
            error: "render error".to_string(),
            not_before_at: None,
        };
        assert_eq!(retry.target_status(), JobStatus::Pending);
        assert_eq!(retry.error(), Some("render error"));
        assert_eq!(
            Transition::Fail {
                error: "x".to_string()
            }
            .target_status(),
            JobStatus::Failed
        );
    }

    #[test]
    fn test_apply_clears_lease_and_keeps_previous_error_on_complete() {
        let now = Utc::now();
        let mut job = NewJobRecord {
            id: JobId::new(),
            tenant_id: TenantId::from("t1"),
            job_type: "license_pdf".to_string(),
            payload: json!({}),
            max_attempts: 3,
            not_before_at: None,
            created_at: now,
        }
        .into_job();
        job.status = JobStatus::Processing;
        job.attempts = 2;
        job.last_error = Some("render error".to_string());
        job.lease_owner = Some(WorkerId::from("w1"));
        job.lease_expires_at = Some(now);

        Transition::Complete.apply(&mut job, now);

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.last_error.as_deref(), Some("render error"));
        assert!(job.lease_owner.is_none());
        assert!(job.lease_expires_at.is_none());
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_connect_store_rejects_unknown_scheme() {
        let config = DatabaseConfig {
            url: "mysql://localhost/jobs".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(matches!(
            connect_store(&config).await,
            Err(JobError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_store_memory() {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..DatabaseConfig::default()
        };
        let store = connect_store(&config).await.unwrap();
        let counts = store.count_by_status(&TenantId::from("t1")).await.unwrap();
        assert_eq!(counts.total(), 0);
    }
}
