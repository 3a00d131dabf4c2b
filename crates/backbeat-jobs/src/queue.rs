//! Producer-facing job queue.

use crate::clock::SharedClock;
use crate::error::{JobError, JobResult};
use crate::events::{SharedEventSink, TransitionEvent};
use crate::job::{Job, JobId, JobPayload, JobQuery, NewJob, NewJobRecord, StatusCounts, TenantId};
use crate::metrics::JobMetrics;
use crate::store::SharedJobStore;
use backbeat_core::ValidateExt;
use tracing::debug;

/// Accepts new jobs and answers tenant-scoped status queries.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: SharedJobStore,
    clock: SharedClock,
    sink: SharedEventSink,
    default_max_attempts: u32,
}

impl JobQueue {
    /// Creates a queue.
    pub fn new(
        store: SharedJobStore,
        clock: SharedClock,
        sink: SharedEventSink,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            default_max_attempts,
        }
    }

    /// Persists a new `pending` job and returns its id.
    ///
    /// Invalid input is rejected before anything is written.
    pub async fn enqueue(&self, request: NewJob) -> JobResult<JobId> {
        request.validate_request()?;

        let now = self.clock.now();
        let not_before_at = match request.run_after {
            Some(delay) => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|_| JobError::Validation(format!("run_after out of range: {delay:?}")))?;
                Some(now.checked_add_signed(delay).ok_or_else(|| {
                    JobError::Validation(format!("run_after out of range: {delay}"))
                })?)
            }
            None => None,
        };

        let job = self
            .store
            .insert(NewJobRecord {
                id: JobId::new(),
                tenant_id: request.tenant_id,
                job_type: request.job_type,
                payload: request.payload,
                max_attempts: request.max_attempts.unwrap_or(self.default_max_attempts),
                not_before_at,
                created_at: now,
            })
            .await?;

        debug!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            job_type = %job.job_type,
            max_attempts = job.max_attempts,
            "Enqueued job"
        );
        JobMetrics::job_enqueued(&job.job_type);
        self.sink.emit(&TransitionEvent::for_job(&job, None, now));

        Ok(job.id)
    }

    /// Enqueues a typed payload under its [`JobPayload::JOB_TYPE`].
    pub async fn enqueue_typed<P: JobPayload>(
        &self,
        tenant_id: impl Into<TenantId>,
        payload: &P,
    ) -> JobResult<JobId> {
        self.enqueue(NewJob::typed(tenant_id, payload)?).await
    }

    /// Fetches one of `tenant_id`'s jobs.
    pub async fn get(&self, tenant_id: &TenantId, job_id: JobId) -> JobResult<Job> {
        self.store
            .get(tenant_id, job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Lists `tenant_id`'s jobs, oldest first.
    pub async fn list(&self, tenant_id: &TenantId, query: &JobQuery) -> JobResult<Vec<Job>> {
        self.store.list(tenant_id, query).await
    }

    /// Per-status job counts for `tenant_id`.
    pub async fn counts(&self, tenant_id: &TenantId) -> JobResult<StatusCounts> {
        self.store.count_by_status(tenant_id).await
    }
}
