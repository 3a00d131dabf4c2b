//! Job handlers and the registry workers dispatch through.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobPayload, WorkerId};
use crate::lease::LeaseManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

/// Executes jobs of one type.
///
/// Returning `Ok` completes the job. A [`JobError::Handler`] or
/// [`JobError::Timeout`] is retried while attempts remain; a
/// [`JobError::Fatal`] fails the job immediately.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Runs one attempt of the job.
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError>;
}

/// Renews the lease on the job being handled.
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    leases: LeaseManager,
    job_id: JobId,
    worker: WorkerId,
    renewed: Arc<watch::Sender<Instant>>,
}

impl LeaseHandle {
    pub(crate) fn new(leases: LeaseManager, job_id: JobId, worker: WorkerId) -> Self {
        let (renewed, _) = watch::channel(Instant::now());
        Self {
            leases,
            job_id,
            worker,
            renewed: Arc::new(renewed),
        }
    }

    /// Instant of the last successful renewal, or of dispatch before any.
    pub(crate) fn renewals(&self) -> watch::Receiver<Instant> {
        self.renewed.subscribe()
    }

    /// Extends the lease by a full lease duration from now.
    ///
    /// Long-running handlers should call this well inside the lease window.
    /// A [`JobError::LeaseLost`] means another worker owns the job now; the
    /// handler should stop and return that error.
    pub async fn renew(&self) -> JobResult<DateTime<Utc>> {
        let expires_at = self.leases.renew(self.job_id, &self.worker).await?;
        self.renewed.send_replace(Instant::now());
        Ok(expires_at)
    }
}

/// Everything a handler gets to see about its job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The claimed job.
    pub job: Job,
    /// Worker running this attempt.
    pub worker_id: WorkerId,
    /// When the handler was dispatched.
    pub started_at: DateTime<Utc>,
    lease: LeaseHandle,
}

impl JobContext {
    pub(crate) fn new(job: Job, worker_id: WorkerId, started_at: DateTime<Utc>, lease: LeaseHandle) -> Self {
        Self {
            job,
            worker_id,
            started_at,
            lease,
        }
    }

    /// Current attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    /// Returns true if a failure now would fail the job for good.
    pub fn is_last_attempt(&self) -> bool {
        self.job.is_exhausted()
    }

    /// Decodes the payload.
    pub fn payload<P: serde::de::DeserializeOwned>(&self) -> JobResult<P> {
        self.job.decode_payload()
    }

    /// Lease handle for this attempt.
    pub fn lease(&self) -> &LeaseHandle {
        &self.lease
    }

    /// Shorthand for `self.lease().renew()`.
    pub async fn renew_lease(&self) -> JobResult<DateTime<Utc>> {
        self.lease.renew().await
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.0)(ctx).await
    }
}

struct TypedHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> JobHandler for TypedHandler<P, F>
where
    P: JobPayload,
    F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        // A payload that does not decode will not decode on the next attempt either.
        let payload: P = ctx
            .job
            .decode_payload()
            .map_err(|e| JobError::Fatal(format!("Invalid {} payload: {e}", P::JOB_TYPE)))?;
        (self.f)(payload, ctx).await
    }
}

/// Maps job types to their handlers.
///
/// Cloning shares the underlying table, so handlers registered after a
/// worker starts are visible to it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, replacing any previous one.
    pub fn register(&self, job_type: impl Into<String>, handler: impl JobHandler) {
        let job_type = job_type.into();
        info!(job_type = %job_type, "Registered job handler");
        self.handlers.write().insert(job_type, Arc::new(handler));
    }

    /// Registers an async closure for `job_type`.
    pub fn register_fn<F, Fut>(&self, job_type: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(job_type, FnHandler(f));
    }

    /// Registers an async closure taking the decoded payload of `P`.
    ///
    /// A payload that fails to decode fails the job without retrying.
    pub fn register_typed<P, F, Fut>(&self, f: F)
    where
        P: JobPayload,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(
            P::JOB_TYPE,
            TypedHandler {
                f,
                _payload: PhantomData,
            },
        );
    }

    /// Looks up the handler for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(job_type).cloned()
    }

    /// Returns true if `job_type` has a handler.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.read().contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NoopEventSink;
    use crate::job::{JobStatus, NewJobRecord, TenantId};
    use crate::store::MemoryJobStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct LicensePdf {
        license_id: String,
    }

    impl JobPayload for LicensePdf {
        const JOB_TYPE: &'static str = "license_pdf";
    }

    fn context(job_type: &str, payload: serde_json::Value) -> JobContext {
        let now = Utc::now();
        let mut job = NewJobRecord {
            id: JobId::new(),
            tenant_id: TenantId::from("t1"),
            job_type: job_type.to_string(),
            payload,
            max_attempts: 2,
            not_before_at: None,
            created_at: now,
        }
        .into_job();
        job.status = JobStatus::Processing;
        job.attempts = 1;

        let leases = LeaseManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(ManualClock::new(now)),
            Arc::new(NoopEventSink),
            Duration::from_secs(60),
        );
        let worker = WorkerId::from("w1");
        let lease = LeaseHandle::new(leases, job.id, worker.clone());
        JobContext::new(job, worker, now, lease)
    }

    #[tokio::test]
    async fn test_register_fn_dispatches() {
        let registry = HandlerRegistry::new();
        registry.register_fn("noop", |_ctx| async { Ok(()) });
        registry.register_fn("boom", |_ctx| async { Err(JobError::handler("render error")) });

        assert_eq!(registry.job_types(), vec!["boom".to_string(), "noop".to_string()]);
        assert!(registry.contains("noop"));
        assert!(registry.get("missing").is_none());

        let noop = registry.get("noop").unwrap();
        assert!(noop.handle(context("noop", json!({}))).await.is_ok());

        let boom = registry.get("boom").unwrap();
        let err = boom.handle(context("boom", json!({}))).await.unwrap_err();
        assert_eq!(err.last_error(), "render error");
    }

    #[tokio::test]
    async fn test_register_typed_decodes_payload() {
        let registry = HandlerRegistry::new();
        registry.register_typed::<LicensePdf, _, _>(|payload, ctx| async move {
            assert_eq!(payload.license_id, "L-42");
            assert_eq!(ctx.attempt(), 1);
            Ok(())
        });

        let handler = registry.get("license_pdf").unwrap();
        let result = handler
            .handle(context("license_pdf", json!({"license_id": "L-42"})))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_register_typed_bad_payload_is_fatal() {
        let registry = HandlerRegistry::new();
        registry.register_typed::<LicensePdf, _, _>(|_payload, _ctx| async { Ok(()) });

        let handler = registry.get("license_pdf").unwrap();
        let err = handler
            .handle(context("license_pdf", json!({"wrong": true})))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Fatal(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_renew_without_lease_is_lease_lost() {
        let ctx = context("noop", json!({}));
        let renewals = ctx.lease().renewals();
        assert!(!ctx.is_last_attempt());
        assert!(matches!(ctx.renew_lease().await, Err(JobError::LeaseLost(_))));
        // A failed renewal does not restart the idle clock.
        assert!(!renewals.has_changed().unwrap());
    }
}
