//! Process-local job store.

use super::{ClaimedJob, JobStore, LeaseGuard, Transition, LEASE_EXPIRED_ERROR};
use crate::error::JobResult;
use crate::job::{ClaimFilter, Job, JobId, JobQuery, JobStatus, NewJobRecord, StatusCounts, TenantId, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Job store kept in memory. Everything is lost when the process exits.
///
/// Each operation runs under a single lock acquisition, which makes claims
/// atomic with respect to each other.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

#[derive(Debug)]
struct Entry {
    // Tie-breaker for equal `created_at`.
    seq: u64,
    job: Job,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs across all tenants.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Returns true if nothing has been enqueued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn sorted<'a>(&'a self, mut keep: impl FnMut(&Job) -> bool) -> Vec<&'a Entry> {
        let mut entries: Vec<&Entry> = self.jobs.values().filter(|e| keep(&e.job)).collect();
        entries.sort_by_key(|e| (e.job.created_at, e.seq));
        entries
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJobRecord) -> JobResult<Job> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let job = job.into_job();
        inner.jobs.insert(
            job.id,
            Entry {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn claim(
        &self,
        filter: &ClaimFilter,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<ClaimedJob>> {
        let mut inner = self.inner.lock();

        let Some(id) = inner
            .sorted(|job| job.is_claimable_at(now) && filter.matches(job))
            .first()
            .map(|e| e.job.id)
        else {
            return Ok(None);
        };

        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let job = &mut entry.job;
        let previous_status = job.status;

        job.status = JobStatus::Processing;
        job.lease_owner = Some(worker.clone());
        job.lease_expires_at = Some(lease_until);
        job.attempts += 1;
        job.updated_at = now;

        Ok(Some(ClaimedJob {
            job: job.clone(),
            previous_status,
        }))
    }

    async fn transition(
        &self,
        id: JobId,
        guard: &LeaseGuard,
        update: Transition,
        now: DateTime<Utc>,
    ) -> JobResult<Option<Job>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let job = &mut entry.job;

        if !job.is_leased_by(&guard.worker) || job.attempts != guard.attempts {
            return Ok(None);
        }

        update.apply(job, now);
        Ok(Some(job.clone()))
    }

    async fn renew(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<DateTime<Utc>>> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let job = &mut entry.job;

        if !job.is_leased_by(worker) {
            return Ok(None);
        }

        job.lease_expires_at = Some(lease_until);
        job.updated_at = now;
        Ok(Some(lease_until))
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> JobResult<Vec<Job>> {
        let mut inner = self.inner.lock();
        let fail = Transition::Fail {
            error: LEASE_EXPIRED_ERROR.to_string(),
        };

        let mut reaped = Vec::new();
        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if job.lease_expired_at(now) && job.is_exhausted() {
                fail.apply(job, now);
                reaped.push((entry.seq, job.clone()));
            }
        }

        reaped.sort_by_key(|(seq, job)| (job.created_at, *seq));
        Ok(reaped.into_iter().map(|(_, job)| job).collect())
    }

    async fn find(&self, id: JobId) -> JobResult<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn get(&self, tenant: &TenantId, id: JobId) -> JobResult<Option<Job>> {
        Ok(self
            .inner
            .lock()
            .jobs
            .get(&id)
            .filter(|e| e.job.tenant_id == *tenant)
            .map(|e| e.job.clone()))
    }

    async fn list(&self, tenant: &TenantId, query: &JobQuery) -> JobResult<Vec<Job>> {
        let inner = self.inner.lock();
        Ok(inner
            .sorted(|job| {
                job.tenant_id == *tenant
                    && query.status.map_or(true, |s| s == job.status)
                    && query.job_type.as_ref().map_or(true, |t| *t == job.job_type)
            })
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .map(|e| e.job.clone())
            .collect())
    }

    async fn count_by_status(&self, tenant: &TenantId) -> JobResult<StatusCounts> {
        let inner = self.inner.lock();
        let mut counts = StatusCounts::default();
        for entry in inner.jobs.values().filter(|e| e.job.tenant_id == *tenant) {
            counts.add(entry.job.status, 1);
        }
        Ok(counts)
    }
}
