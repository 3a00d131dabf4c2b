//! Lease acquisition, renewal and reaping.

use crate::clock::SharedClock;
use crate::error::{JobError, JobResult};
use crate::events::{SharedEventSink, TransitionEvent};
use crate::job::{ClaimFilter, Job, JobId, JobStatus, WorkerId};
use crate::metrics::JobMetrics;
use crate::store::SharedJobStore;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The worker now holds the lease on this job.
    Claimed(Job),
    /// Nothing eligible right now. Not an error.
    NoJobAvailable,
}

impl ClaimOutcome {
    /// Returns the claimed job, if any.
    pub fn into_job(self) -> Option<Job> {
        match self {
            ClaimOutcome::Claimed(job) => Some(job),
            ClaimOutcome::NoJobAvailable => None,
        }
    }
}

/// Hands out time-bounded exclusive claims on jobs.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: SharedJobStore,
    clock: SharedClock,
    sink: SharedEventSink,
    lease_duration: Duration,
}

impl LeaseManager {
    /// Creates a lease manager.
    pub fn new(
        store: SharedJobStore,
        clock: SharedClock,
        sink: SharedEventSink,
        lease_duration: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            lease_duration,
        }
    }

    /// Configured lease length.
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Current time on the engine clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let millis = i64::try_from(self.lease_duration.as_millis()).unwrap_or(i64::MAX);
        now.checked_add_signed(chrono::Duration::milliseconds(millis))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Claims the oldest eligible job matching `filter` for `worker`.
    pub async fn claim(&self, worker: &WorkerId, filter: &ClaimFilter) -> JobResult<ClaimOutcome> {
        let now = self.clock.now();
        let lease_until = self.lease_until(now);

        let Some(claimed) = self.store.claim(filter, worker, now, lease_until).await? else {
            return Ok(ClaimOutcome::NoJobAvailable);
        };

        let job = claimed.job;
        let reclaimed = claimed.previous_status == JobStatus::Processing;
        if reclaimed {
            warn!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                job_type = %job.job_type,
                worker_id = %worker,
                attempts = job.attempts,
                "Reclaimed job with expired lease"
            );
        } else {
            debug!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                job_type = %job.job_type,
                worker_id = %worker,
                attempts = job.attempts,
                "Claimed job"
            );
        }

        JobMetrics::job_claimed(&job.job_type, reclaimed);
        self.sink.emit(&TransitionEvent::for_job(
            &job,
            Some(claimed.previous_status),
            now,
        ));

        Ok(ClaimOutcome::Claimed(job))
    }

    /// Extends `worker`'s lease on `job_id` by a full lease duration.
    ///
    /// Fails with [`JobError::LeaseLost`] once another worker has taken the
    /// job over or it has left `processing`.
    pub async fn renew(&self, job_id: JobId, worker: &WorkerId) -> JobResult<DateTime<Utc>> {
        let now = self.clock.now();
        match self
            .store
            .renew(job_id, worker, now, self.lease_until(now))
            .await?
        {
            Some(expires_at) => {
                debug!(job_id = %job_id, worker_id = %worker, %expires_at, "Renewed lease");
                Ok(expires_at)
            }
            None => {
                warn!(job_id = %job_id, worker_id = %worker, "Lease renewal rejected");
                Err(JobError::LeaseLost(job_id.to_string()))
            }
        }
    }

    /// Fails every expired lease whose job has no attempts left.
    ///
    /// Returns the number of jobs moved to `failed`.
    pub async fn reap_expired(&self) -> JobResult<usize> {
        let now = self.clock.now();
        let reaped = self.store.reap_expired(now).await?;

        for job in &reaped {
            info!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                job_type = %job.job_type,
                attempts = job.attempts,
                "Failed job after its final lease expired"
            );
            JobMetrics::job_failed(&job.job_type, "lease_expired");
            self.sink
                .emit(&TransitionEvent::for_job(job, Some(JobStatus::Processing), now));
        }

        if !reaped.is_empty() {
            JobMetrics::leases_reaped(reaped.len());
        }
        Ok(reaped.len())
    }
}
