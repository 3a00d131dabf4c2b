//! SQLite job store.

use super::{
    millis_to_datetime, to_u32, ClaimedJob, JobStore, LeaseGuard, Transition, LEASE_EXPIRED_ERROR,
};
use crate::error::{JobError, JobResult};
use crate::job::{ClaimFilter, Job, JobId, JobQuery, JobStatus, NewJobRecord, StatusCounts, TenantId, WorkerId};
use async_trait::async_trait;
use backbeat_config::DatabaseConfig;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const JOB_COLUMNS: &str = "id, tenant_id, job_type, payload, status, attempts, max_attempts, \
     last_error, lease_owner, lease_expires_at, not_before_at, created_at, updated_at";

// ?1 = now (ms), ?2 = tenant or NULL, ?3 = JSON array of types ('[]' = any)
const ELIGIBLE: &str = "(status = 'pending' \
        OR (status = 'processing' AND lease_expires_at < ?1 AND attempts < max_attempts)) \
     AND (not_before_at IS NULL OR not_before_at <= ?1) \
     AND (?2 IS NULL OR tenant_id = ?2) \
     AND (?3 = '[]' OR job_type IN (SELECT value FROM json_each(?3)))";

/// A lost compare-and-swap means another worker took the candidate first.
const CLAIM_RETRIES: usize = 5;

/// Job store backed by SQLite.
///
/// SQLite serialises writers, so each claim is a read of the oldest candidate
/// followed by an `UPDATE` that only succeeds if the candidate is unchanged.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Opens a pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> JobResult<Self> {
        info!("Connecting to SQLite job store...");

        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| JobError::Configuration(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Every connection to `:memory:` is a separate database.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .min_connections(config.min_connections)
                .max_connections(config.max_connections)
                .idle_timeout(Some(config.idle_timeout()))
        };

        let pool = pool_options
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|e| {
                warn!("Failed to connect to SQLite: {}", e);
                JobError::StoreUnavailable(format!("Failed to connect: {e}"))
            })?;

        info!("SQLite job store ready");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Database row representation of a job.
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    tenant_id: String,
    job_type: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    not_before_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = JobId::parse(&row.id)
            .map_err(|e| JobError::Internal(format!("Invalid job id in database: {e}")))?;

        Ok(Job {
            id,
            tenant_id: TenantId::new(row.tenant_id),
            job_type: row.job_type,
            payload: serde_json::from_str(&row.payload)?,
            status: row.status.parse()?,
            attempts: to_u32(row.attempts, "attempts")?,
            max_attempts: to_u32(row.max_attempts, "max_attempts")?,
            last_error: row.last_error,
            lease_owner: row.lease_owner.map(WorkerId::new),
            lease_expires_at: row.lease_expires_at.map(millis_to_datetime).transpose()?,
            not_before_at: row.not_before_at.map(millis_to_datetime).transpose()?,
            created_at: millis_to_datetime(row.created_at)?,
            updated_at: millis_to_datetime(row.updated_at)?,
        })
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: NewJobRecord) -> JobResult<Job> {
        let payload = serde_json::to_string(&job.payload)?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (id, tenant_id, job_type, payload, status, attempts, max_attempts,
                              not_before_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?7)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id.to_string())
        .bind(job.tenant_id.as_str())
        .bind(&job.job_type)
        .bind(payload)
        .bind(i64::from(job.max_attempts))
        .bind(job.not_before_at.map(millis))
        .bind(millis(job.created_at))
        .fetch_one(&self.pool)
        .await?;

        Job::try_from(row)
    }

    async fn claim(
        &self,
        filter: &ClaimFilter,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<ClaimedJob>> {
        let tenant = filter.tenant_id.as_ref().map(TenantId::as_str);
        let types = serde_json::to_string(&filter.job_types)?;

        let select = format!(
            "SELECT id, status, attempts FROM jobs WHERE {ELIGIBLE} \
             ORDER BY created_at, rowid LIMIT 1"
        );
        let update = format!(
            r#"
            UPDATE jobs
            SET status = 'processing', lease_owner = ?4, lease_expires_at = ?5,
                attempts = attempts + 1, updated_at = ?1
            WHERE id = ?6 AND status = ?7 AND attempts = ?8 AND {ELIGIBLE}
            RETURNING {JOB_COLUMNS}
            "#
        );

        for _ in 0..CLAIM_RETRIES {
            let candidate = sqlx::query_as::<_, (String, String, i64)>(&select)
                .bind(millis(now))
                .bind(tenant)
                .bind(&types)
                .fetch_optional(&self.pool)
                .await?;

            let Some((id, status, attempts)) = candidate else {
                return Ok(None);
            };

            let row = sqlx::query_as::<_, JobRow>(&update)
                .bind(millis(now))
                .bind(tenant)
                .bind(&types)
                .bind(worker.as_str())
                .bind(millis(lease_until))
                .bind(&id)
                .bind(&status)
                .bind(attempts)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = row {
                return Ok(Some(ClaimedJob {
                    job: Job::try_from(row)?,
                    previous_status: status.parse::<JobStatus>()?,
                }));
            }

            debug!(job_id = %id, worker_id = %worker, "Lost claim race, retrying");
        }

        Ok(None)
    }

    async fn transition(
        &self,
        id: JobId,
        guard: &LeaseGuard,
        update: Transition,
        now: DateTime<Utc>,
    ) -> JobResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = ?1, last_error = COALESCE(?2, last_error),
                lease_owner = NULL, lease_expires_at = NULL,
                not_before_at = ?3, updated_at = ?4
            WHERE id = ?5 AND status = 'processing' AND lease_owner = ?6 AND attempts = ?7
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(update.target_status().as_str())
        .bind(update.error())
        .bind(update.not_before_at().map(millis))
        .bind(millis(now))
        .bind(id.to_string())
        .bind(guard.worker.as_str())
        .bind(i64::from(guard.attempts))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn renew(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<DateTime<Utc>>> {
        let renewed = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE jobs
            SET lease_expires_at = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'processing' AND lease_owner = ?4
            RETURNING lease_expires_at
            "#,
        )
        .bind(millis(lease_until))
        .bind(millis(now))
        .bind(id.to_string())
        .bind(worker.as_str())
        .fetch_optional(&self.pool)
        .await?;

        renewed.map(millis_to_datetime).transpose()
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> JobResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = ?1,
                lease_owner = NULL, lease_expires_at = NULL,
                not_before_at = NULL, updated_at = ?2
            WHERE status = 'processing' AND lease_expires_at < ?2 AND attempts >= max_attempts
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(LEASE_EXPIRED_ERROR)
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<JobResult<Vec<_>>>()?;
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn find(&self, id: JobId) -> JobResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn get(&self, tenant: &TenantId, id: JobId) -> JobResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 AND tenant_id = ?2"
        ))
        .bind(id.to_string())
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list(&self, tenant: &TenantId, query: &JobQuery) -> JobResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE tenant_id = ?1
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR job_type = ?3)
            ORDER BY created_at, rowid
            LIMIT ?4 OFFSET ?5
            "#
        ))
        .bind(tenant.as_str())
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.job_type.as_deref())
        .bind(i64::from(query.limit))
        .bind(i64::from(query.offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count_by_status(&self, tenant: &TenantId) -> JobResult<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs WHERE tenant_id = ?1 GROUP BY status",
        )
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(status.parse()?, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn migrate(&self) -> JobResult<()> {
        info!("Running SQLite job store migrations...");
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        info!("SQLite job store migrations completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn store() -> SqliteJobStore {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        };
        let store = SqliteJobStore::connect(&config).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn record(job_type: &str, created_at: DateTime<Utc>) -> NewJobRecord {
        NewJobRecord {
            id: JobId::new(),
            tenant_id: TenantId::from("t1"),
            job_type: job_type.to_string(),
            payload: json!({"licenseId": "L1"}),
            max_attempts: 3,
            not_before_at: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_insert_round_trips_payload() {
        let store = store().await;
        let now = Utc::now();
        let inserted = store.insert(record("license_pdf", now)).await.unwrap();

        let found = store.find(inserted.id).await.unwrap().unwrap();
        assert_eq!(found.payload, json!({"licenseId": "L1"}));
        assert_eq!(found.status, JobStatus::Pending);
        assert_eq!(found.attempts, 0);
        assert_eq!(found.created_at.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_claim_filters_by_type() {
        let store = store().await;
        let now = Utc::now();
        store.insert(record("preview_generate", now)).await.unwrap();
        let pdf = store
            .insert(record("license_pdf", now + Duration::milliseconds(1)))
            .await
            .unwrap();

        let claimed = store
            .claim(
                &ClaimFilter::for_types(["license_pdf"]),
                &WorkerId::from("w1"),
                now + Duration::seconds(1),
                now + Duration::seconds(61),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(claimed.job.id, pdf.id);
        assert_eq!(claimed.previous_status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_respects_not_before() {
        let store = store().await;
        let now = Utc::now();
        let mut delayed = record("license_pdf", now);
        delayed.not_before_at = Some(now + Duration::seconds(30));
        store.insert(delayed).await.unwrap();
        let worker = WorkerId::from("w1");

        assert!(store
            .claim(&ClaimFilter::any(), &worker, now, now + Duration::seconds(60))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim(
                &ClaimFilter::any(),
                &worker,
                now + Duration::seconds(30),
                now + Duration::seconds(90)
            )
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let store = store().await;
        let now = Utc::now();
        store.insert(record("a", now)).await.unwrap();
        store.insert(record("a", now)).await.unwrap();
        store
            .claim(
                &ClaimFilter::any(),
                &WorkerId::from("w1"),
                now,
                now + Duration::seconds(60),
            )
            .await
            .unwrap();

        let counts = store.count_by_status(&TenantId::from("t1")).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.total(), 2);
    }
}
