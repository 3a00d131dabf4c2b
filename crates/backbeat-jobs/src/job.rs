//! Job records and definitions.

use crate::error::{JobError, JobResult};
use backbeat_core::validation::rules;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError};

pub use backbeat_core::{JobId, TenantId, WorkerId};

/// Job status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    #[default]
    Pending,
    /// Leased by a worker.
    Processing,
    /// Handler succeeded. Terminal.
    Completed,
    /// Attempts exhausted or the failure was not retryable. Terminal.
    Failed,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobError::Internal(format!("Unknown job status: {other}"))),
        }
    }
}

/// A unit of deferred work as stored in the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Incremented exactly once per claim.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// Set only while `status` is `processing`.
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time a retried job may be claimed again.
    pub not_before_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Returns true once no attempts remain.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Returns true if the job is processing under a lease that has run out.
    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expires_at.is_some_and(|expires| expires < now)
    }

    /// The claim eligibility predicate shared by every store.
    ///
    /// A processing job with an expired lease counts as pending, unless its
    /// attempts are spent; those are left for the reaper to fail.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        let ready = self.not_before_at.map_or(true, |t| t <= now);
        let status_ok = match self.status {
            JobStatus::Pending => true,
            JobStatus::Processing => self.lease_expired_at(now) && !self.is_exhausted(),
            JobStatus::Completed | JobStatus::Failed => false,
        };
        ready && status_ok
    }

    /// Returns true if `worker` currently holds the lease, expired or not.
    pub fn is_leased_by(&self, worker: &WorkerId) -> bool {
        self.status == JobStatus::Processing && self.lease_owner.as_ref() == Some(worker)
    }

    /// Decodes the payload into a handler's input type.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> JobResult<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Trait for typed job payloads.
///
/// The engine never looks inside a payload; this trait only ties a Rust type
/// to the `job_type` string its handler is registered under.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct LicensePdf {
///     license_id: String,
/// }
///
/// impl JobPayload for LicensePdf {
///     const JOB_TYPE: &'static str = "license_pdf";
/// }
/// ```
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator used as the job's `type`.
    const JOB_TYPE: &'static str;

    /// Attempt ceiling when the producer does not pass one.
    const MAX_ATTEMPTS: Option<u32> = None;
}

fn tenant_not_blank(tenant: &TenantId) -> Result<(), ValidationError> {
    rules::not_blank(tenant.as_str())
}

/// Producer-side request to create a job.
#[derive(Debug, Clone, Validate)]
pub struct NewJob {
    #[validate(custom(function = "tenant_not_blank", message = "must not be blank"))]
    pub tenant_id: TenantId,

    #[validate(custom(function = "rules::not_blank", message = "must not be blank"))]
    pub job_type: String,

    pub payload: serde_json::Value,

    /// Falls back to the configured default when unset.
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub max_attempts: Option<u32>,

    /// Delay before the first claim is allowed.
    pub run_after: Option<Duration>,
}

impl NewJob {
    /// Creates a new job request.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            job_type: job_type.into(),
            payload,
            max_attempts: None,
            run_after: None,
        }
    }

    /// Creates a job request from a typed payload.
    pub fn typed<P: JobPayload>(tenant_id: impl Into<TenantId>, payload: &P) -> JobResult<Self> {
        Ok(Self {
            max_attempts: P::MAX_ATTEMPTS,
            ..Self::new(tenant_id, P::JOB_TYPE, serde_json::to_value(payload)?)
        })
    }

    /// Sets the attempt ceiling.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Defers the first claim.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.run_after = Some(delay);
        self
    }
}

/// A fully resolved job ready for insertion.
#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub not_before_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewJobRecord {
    /// The `pending` job this record becomes once stored.
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            tenant_id: self.tenant_id,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            not_before_at: self.not_before_at,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Narrows which jobs a claim may pick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Restrict to one tenant.
    pub tenant_id: Option<TenantId>,
    /// Restrict to these types. Empty means any type.
    pub job_types: Vec<String>,
}

impl ClaimFilter {
    /// Matches every job.
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches jobs of the given types.
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenant_id: None,
            job_types: types.into_iter().map(Into::into).collect(),
        }
    }

    /// Restricts the filter to one tenant.
    pub fn tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Returns true if the job passes the tenant and type restrictions.
    pub fn matches(&self, job: &Job) -> bool {
        self.tenant_id.as_ref().map_or(true, |t| *t == job.tenant_id)
            && (self.job_types.is_empty() || self.job_types.iter().any(|t| *t == job.job_type))
    }
}

/// Tenant-scoped listing query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobQuery {
    /// Filters by status.
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filters by type.
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Sets the page window.
    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Number of a tenant's jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    /// Adds `count` jobs under `status`.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    /// Total across all statuses.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
