//! PostgreSQL job store.

use super::{to_u32, ClaimedJob, JobStore, LeaseGuard, Transition, LEASE_EXPIRED_ERROR};
use crate::error::{JobError, JobResult};
use crate::job::{ClaimFilter, Job, JobId, JobQuery, NewJobRecord, StatusCounts, TenantId, WorkerId};
use async_trait::async_trait;
use backbeat_config::DatabaseConfig;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{info, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, tenant_id, job_type, payload, status, attempts, max_attempts, \
     last_error, lease_owner, lease_expires_at, not_before_at, created_at, updated_at";

/// Job store backed by PostgreSQL.
///
/// Claims lock the oldest eligible row with `FOR UPDATE SKIP LOCKED`, so
/// concurrent claimers each move on to a different row instead of queueing
/// behind one another.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Opens a pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> JobResult<Self> {
        info!("Connecting to PostgreSQL job store...");

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .map_err(|e| {
                warn!("Failed to connect to PostgreSQL: {}", e);
                JobError::StoreUnavailable(format!("Failed to connect: {e}"))
            })?;

        info!("PostgreSQL job store ready");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Database row representation of a job.
#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    tenant_id: String,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    not_before_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ClaimRow {
    #[sqlx(flatten)]
    job: JobRow,
    previous_status: String,
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            job_type: row.job_type,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: to_u32(i64::from(row.attempts), "attempts")?,
            max_attempts: to_u32(i64::from(row.max_attempts), "max_attempts")?,
            last_error: row.last_error,
            lease_owner: row.lease_owner.map(WorkerId::new),
            lease_expires_at: row.lease_expires_at,
            not_before_at: row.not_before_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_i32(value: u32, column: &str) -> JobResult<i32> {
    i32::try_from(value).map_err(|_| JobError::Validation(format!("{column} out of range: {value}")))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: NewJobRecord) -> JobResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (id, tenant_id, job_type, payload, status, attempts, max_attempts,
                              not_before_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $7, $7)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id.into_inner())
        .bind(job.tenant_id.as_str())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(to_i32(job.max_attempts, "max_attempts")?)
        .bind(job.not_before_at)
        .bind(job.created_at)
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
        let row = sqlx::query_as::<_, ClaimRow>(
            r#"
            WITH candidate AS (
                SELECT id, status AS previous_status
                FROM jobs
                WHERE (status = 'pending'
                       OR (status = 'processing' AND lease_expires_at < $1
                           AND attempts < max_attempts))
                  AND (not_before_at IS NULL OR not_before_at <= $1)
                  AND ($2::text IS NULL OR tenant_id = $2)
                  AND (cardinality($3::text[]) = 0 OR job_type = ANY($3))
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'processing', lease_owner = $4, lease_expires_at = $5,
                attempts = j.attempts + 1, updated_at = $1
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING j.id, j.tenant_id, j.job_type, j.payload, j.status, j.attempts,
                      j.max_attempts, j.last_error, j.lease_owner, j.lease_expires_at,
                      j.not_before_at, j.created_at, j.updated_at, candidate.previous_status
            "#,
        )
        .bind(now)
        .bind(filter.tenant_id.as_ref().map(TenantId::as_str))
        .bind(&filter.job_types)
        .bind(worker.as_str())
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> JobResult<ClaimedJob> {
            Ok(ClaimedJob {
                previous_status: row.previous_status.parse()?,
                job: Job::try_from(row.job)?,
            })
        })
        .transpose()
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
            SET status = $1, last_error = COALESCE($2, last_error),
                lease_owner = NULL, lease_expires_at = NULL,
                not_before_at = $3, updated_at = $4
            WHERE id = $5 AND status = 'processing' AND lease_owner = $6 AND attempts = $7
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(update.target_status().as_str())
        .bind(update.error())
        .bind(update.not_before_at())
        .bind(now)
        .bind(id.into_inner())
        .bind(guard.worker.as_str())
        .bind(to_i32(guard.attempts, "attempts")?)
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
        let renewed = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE jobs
            SET lease_expires_at = $1, updated_at = $2
            WHERE id = $3 AND status = 'processing' AND lease_owner = $4
            RETURNING lease_expires_at
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(id.into_inner())
        .bind(worker.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(renewed)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> JobResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $1,
                lease_owner = NULL, lease_expires_at = NULL,
                not_before_at = NULL, updated_at = $2
            WHERE status = 'processing' AND lease_expires_at < $2 AND attempts >= max_attempts
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(LEASE_EXPIRED_ERROR)
        .bind(now)
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
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id.into_inner())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn get(&self, tenant: &TenantId, id: JobId) -> JobResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(id.into_inner())
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list(&self, tenant: &TenantId, query: &JobQuery) -> JobResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR job_type = $3)
            ORDER BY created_at, id
            LIMIT $4 OFFSET $5
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
            "SELECT status, COUNT(*) FROM jobs WHERE tenant_id = $1 GROUP BY status",
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
        info!("Running PostgreSQL job store migrations...");
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!("PostgreSQL job store migrations completed");
        Ok(())
    }
}
