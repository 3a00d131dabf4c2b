//! Applies handler outcomes to leased jobs.

use crate::clock::SharedClock;
use crate::error::{JobError, JobResult};
use crate::events::{SharedEventSink, TransitionEvent};
use crate::job::{Job, JobId, JobStatus, WorkerId};
use crate::metrics::JobMetrics;
use crate::retry::RetryPolicy;
use crate::store::{LeaseGuard, SharedJobStore, Transition};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// What happened to a reported outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The job moved to the returned state.
    Applied(Job),
    /// The reporting worker did not hold the lease. Nothing was written.
    Rejected,
}

impl Outcome {
    /// Returns the updated job, if the outcome was applied.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Outcome::Applied(job) => Some(job),
            Outcome::Rejected => None,
        }
    }

    /// Returns true if the write was rejected.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected)
    }
}

/// Turns success and failure reports into state transitions.
///
/// Every write is guarded by the reporter's lease, so a worker whose job was
/// reclaimed cannot overwrite the new holder's progress.
#[derive(Debug, Clone)]
pub struct OutcomeReducer {
    store: SharedJobStore,
    clock: SharedClock,
    sink: SharedEventSink,
    retry: RetryPolicy,
}

impl OutcomeReducer {
    /// Creates a reducer.
    pub fn new(
        store: SharedJobStore,
        clock: SharedClock,
        sink: SharedEventSink,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            retry,
        }
    }

    /// Retry policy applied to retryable failures.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Marks `job_id` completed.
    ///
    /// Accepted while `worker` holds the lease, whichever attempt that is.
    /// Workers report through [`complete_attempt`](Self::complete_attempt).
    pub async fn complete(&self, job_id: JobId, worker: &WorkerId) -> JobResult<Outcome> {
        self.report_complete(job_id, worker, None).await
    }

    /// Marks `job_id` completed if `worker` still holds the lease it took
    /// at `attempt`.
    pub async fn complete_attempt(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        attempt: u32,
    ) -> JobResult<Outcome> {
        self.report_complete(job_id, worker, Some(attempt)).await
    }

    /// Records a failed attempt on `job_id`.
    ///
    /// The job goes back to `pending` while attempts remain and the error is
    /// retryable. Otherwise it becomes `failed`.
    pub async fn fail(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: &JobError,
    ) -> JobResult<Outcome> {
        self.report_failure(job_id, worker, None, error).await
    }

    /// Records a failure of the attempt `worker` claimed at `attempt`.
    pub async fn fail_attempt(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        attempt: u32,
        error: &JobError,
    ) -> JobResult<Outcome> {
        self.report_failure(job_id, worker, Some(attempt), error).await
    }

    async fn report_complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        attempt: Option<u32>,
    ) -> JobResult<Outcome> {
        let Some(job) = self.leased_job(job_id, worker, attempt, "complete").await? else {
            return Ok(Outcome::Rejected);
        };
        self.apply(job, worker, Transition::Complete, "complete")
            .await
    }

    async fn report_failure(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        attempt: Option<u32>,
        error: &JobError,
    ) -> JobResult<Outcome> {
        let Some(job) = self.leased_job(job_id, worker, attempt, "fail").await? else {
            return Ok(Outcome::Rejected);
        };
        let transition = self.decide(&job, error, self.clock.now());
        self.apply(job, worker, transition, "fail").await
    }

    fn decide(&self, job: &Job, error: &JobError, now: DateTime<Utc>) -> Transition {
        let message = error.last_error();
        if !error.is_retryable() || job.is_exhausted() {
            Transition::Fail { error: message }
        } else {
            Transition::Retry {
                error: message,
                not_before_at: self.retry.next_run_at(job.attempts, now),
            }
        }
    }

    async fn leased_job(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        attempt: Option<u32>,
        operation: &'static str,
    ) -> JobResult<Option<Job>> {
        let job = self
            .store
            .find(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let same_attempt = attempt.map_or(true, |claimed| claimed == job.attempts);
        if job.is_leased_by(worker) && same_attempt {
            return Ok(Some(job));
        }

        warn!(
            job_id = %job_id,
            worker_id = %worker,
            status = %job.status,
            lease_owner = ?job.lease_owner.as_ref().map(WorkerId::as_str),
            attempts = job.attempts,
            reported_attempt = ?attempt,
            operation,
            "Ignoring outcome from worker that does not hold the lease"
        );
        JobMetrics::zombie_write(operation);
        Ok(None)
    }

    async fn apply(
        &self,
        job: Job,
        worker: &WorkerId,
        transition: Transition,
        operation: &'static str,
    ) -> JobResult<Outcome> {
        let now = self.clock.now();
        let guard = LeaseGuard {
            worker: worker.clone(),
            attempts: job.attempts,
        };

        let Some(updated) = self
            .store
            .transition(job.id, &guard, transition, now)
            .await?
        else {
            warn!(
                job_id = %job.id,
                worker_id = %worker,
                operation,
                "Lease changed before the outcome was written"
            );
            JobMetrics::zombie_write(operation);
            return Ok(Outcome::Rejected);
        };

        match updated.status {
            JobStatus::Completed => {
                info!(
                    job_id = %updated.id,
                    job_type = %updated.job_type,
                    attempts = updated.attempts,
                    "Job completed"
                );
                JobMetrics::job_completed(&updated.job_type);
            }
            JobStatus::Pending => {
                warn!(
                    job_id = %updated.id,
                    job_type = %updated.job_type,
                    attempts = updated.attempts,
                    max_attempts = updated.max_attempts,
                    not_before_at = ?updated.not_before_at,
                    error = updated.last_error.as_deref().unwrap_or_default(),
                    "Job failed, will retry"
                );
                JobMetrics::job_retried(&updated.job_type, updated.attempts);
            }
            JobStatus::Failed => {
                warn!(
                    job_id = %updated.id,
                    job_type = %updated.job_type,
                    attempts = updated.attempts,
                    error = updated.last_error.as_deref().unwrap_or_default(),
                    "Job failed permanently"
                );
                JobMetrics::job_failed(&updated.job_type, "handler");
            }
            JobStatus::Processing => {}
        }

        self.sink.emit(&TransitionEvent::for_job(
            &updated,
            Some(JobStatus::Processing),
            now,
        ));
        Ok(Outcome::Applied(updated))
    }
}
