//! Workers and the worker pool.
//!
//! A [`Worker`] is one claim/execute/report loop. A [`WorkerPool`] runs a
//! fixed number of them side by side, each with its own identity, and
//! drains them on shutdown.

use crate::error::{JobError, JobResult};
use crate::handler::{HandlerRegistry, JobContext, LeaseHandle};
use crate::job::{ClaimFilter, Job, JobId, JobStatus, WorkerId};
use crate::lease::{ClaimOutcome, LeaseManager};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::reducer::{Outcome, OutcomeReducer};
use backbeat_config::WorkerConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,

    /// Job types to claim. Empty claims every type.
    pub job_types: Vec<String>,

    /// Sleep between empty polls.
    pub poll_interval: Duration,

    /// How long a handler may go without renewing its lease before it is
    /// aborted. `None` lets handlers run for as long as they need.
    pub handler_timeout: Option<Duration>,

    /// How long `start` waits for in-flight jobs after `stop`.
    pub shutdown_timeout: Duration,

    /// Minimum spacing between expired-lease sweeps.
    pub reap_interval: Duration,

    /// Prefix for the pool id.
    pub identity_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            job_types: config.job_types.clone(),
            poll_interval: config.poll_interval(),
            handler_timeout: config.handler_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            reap_interval: config.reap_interval(),
            identity_prefix: config.identity_prefix.clone(),
        }
    }
}

impl WorkerPoolConfig {
    fn filter(&self) -> ClaimFilter {
        ClaimFilter::for_types(self.job_types.iter().cloned())
    }
}

/// Receiving side of a shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Returns true once shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn recv(&mut self) {
        // A dropped sender counts as shutdown.
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// Sending side of a shutdown request.
#[derive(Debug)]
pub struct Shutdown(watch::Sender<bool>);

impl Shutdown {
    /// Creates an untriggered shutdown switch.
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    /// Returns a new receiver.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }

    /// Requests shutdown.
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// What a single [`Worker::run_once`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// No eligible job.
    Idle,
    /// The job completed.
    Completed(JobId),
    /// The attempt failed and the job went back to `pending`.
    Retried(JobId),
    /// The job failed permanently.
    Failed(JobId),
    /// The outcome was not written because the lease had moved on.
    Rejected(JobId),
    /// The handler gave up after losing its lease. Nothing was reported.
    LeaseLost(JobId),
}

#[derive(Debug, Default)]
struct WorkerCounters {
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl WorkerCounters {
    fn record(&self, iteration: Iteration) {
        let counter = match iteration {
            Iteration::Completed(_) => &self.completed,
            Iteration::Retried(_) => &self.retried,
            Iteration::Failed(_) => &self.failed,
            Iteration::Rejected(_) | Iteration::LeaseLost(_) => &self.rejected,
            Iteration::Idle => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A single claim/execute/report loop.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    leases: LeaseManager,
    reducer: OutcomeReducer,
    handlers: HandlerRegistry,
    filter: ClaimFilter,
    poll_interval: Duration,
    handler_timeout: Option<Duration>,
    reap_interval: Duration,
    pool_id: Option<String>,
    counters: Arc<WorkerCounters>,
    last_reap: Mutex<Option<Instant>>,
}

impl Worker {
    /// Creates a worker.
    pub fn new(
        id: WorkerId,
        leases: LeaseManager,
        reducer: OutcomeReducer,
        handlers: HandlerRegistry,
        config: &WorkerPoolConfig,
    ) -> Self {
        Self {
            id,
            leases,
            reducer,
            handlers,
            filter: config.filter(),
            poll_interval: config.poll_interval,
            handler_timeout: config.handler_timeout,
            reap_interval: config.reap_interval,
            pool_id: None,
            counters: Arc::default(),
            last_reap: Mutex::new(None),
        }
    }

    /// Restricts claims to `filter`.
    pub fn with_filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = filter;
        self
    }

    fn in_pool(mut self, pool_id: String, counters: Arc<WorkerCounters>) -> Self {
        self.pool_id = Some(pool_id);
        self.counters = counters;
        self
    }

    /// Worker identity.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Loops until `shutdown` fires.
    ///
    /// A job already in flight finishes and is reported before the loop
    /// exits.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        async move {
            info!(job_types = ?self.filter.job_types, "Worker started");

            while !shutdown.is_shutdown() {
                let idle = match self.run_once().await {
                    Ok(Iteration::Idle) => true,
                    Ok(_) => false,
                    Err(e) => {
                        error!(error = %e, "Worker iteration failed");
                        true
                    }
                };

                if idle {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }

            info!("Worker stopped");
        }
        .instrument(info_span!("worker", worker_id = %self.id))
        .await
    }

    /// Claims and runs at most one job.
    ///
    /// Store failures are returned; handler failures are reported through
    /// the reducer and show up in the returned [`Iteration`].
    pub async fn run_once(&self) -> JobResult<Iteration> {
        match self.leases.claim(&self.id, &self.filter).await? {
            ClaimOutcome::Claimed(job) => {
                let iteration = self.process(job).await?;
                self.counters.record(iteration);
                Ok(iteration)
            }
            ClaimOutcome::NoJobAvailable => {
                self.reap_if_due().await;
                Ok(Iteration::Idle)
            }
        }
    }

    async fn process(&self, job: Job) -> JobResult<Iteration> {
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let attempt = job.attempts;

        let Some(handler) = self.handlers.get(&job_type) else {
            error!(job_id = %job_id, job_type = %job_type, "No handler registered for job type");
            let outcome = self
                .reducer
                .fail_attempt(job_id, &self.id, attempt, &JobError::UnknownJobType(job_type))
                .await?;
            return Ok(iteration_for(job_id, &outcome));
        };

        debug!(job_id = %job_id, job_type = %job_type, attempt, "Processing job");

        let span = info_span!("job", job_id = %job_id, job_type = %job_type, attempt);
        let lease = LeaseHandle::new(self.leases.clone(), job_id, self.id.clone());
        let renewals = lease.renewals();
        let ctx = JobContext::new(job, self.id.clone(), self.leases.now(), lease);

        if let Some(pool_id) = &self.pool_id {
            WorkerMetrics::job_started(pool_id);
        }
        let started = Instant::now();

        // A panicking handler unwinds its own task, not the worker. The set is
        // owned by this future, so dropping the worker aborts the handler too.
        let mut running = JoinSet::new();
        running.spawn(async move { handler.handle(ctx).await }.instrument(span));
        let result = self.await_handler(job_id, &mut running, renewals).await;

        if let Some(pool_id) = &self.pool_id {
            WorkerMetrics::job_finished(pool_id);
        }
        JobMetrics::handler_duration(
            &job_type,
            if result.is_ok() { "success" } else { "failure" },
            started.elapsed(),
        );

        let outcome = match result {
            Ok(()) => self.reducer.complete_attempt(job_id, &self.id, attempt).await?,
            Err(JobError::LeaseLost(_)) => {
                warn!(job_id = %job_id, "Handler lost its lease; not reporting an outcome");
                return Ok(Iteration::LeaseLost(job_id));
            }
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Job execution failed");
                self.reducer.fail_attempt(job_id, &self.id, attempt, &e).await?
            }
        };

        Ok(iteration_for(job_id, &outcome))
    }

    /// Waits for the handler, aborting it once it has gone `handler_timeout`
    /// without renewing its lease.
    async fn await_handler(
        &self,
        job_id: JobId,
        running: &mut JoinSet<JobResult<()>>,
        mut renewals: watch::Receiver<Instant>,
    ) -> JobResult<()> {
        let Some(limit) = self.handler_timeout else {
            return handler_finished(running.join_next().await);
        };

        loop {
            let deadline = *renewals.borrow_and_update() + limit;
            tokio::select! {
                biased;
                joined = running.join_next() => return handler_finished(joined),
                () = sleep_until(deadline) => {
                    if !renewals.has_changed().unwrap_or(false) {
                        running.abort_all();
                        warn!(job_id = %job_id, timeout = ?limit, "Job timed out without renewing its lease");
                        return Err(JobError::Timeout(limit));
                    }
                }
            }
        }
    }

    async fn reap_if_due(&self) {
        let due = {
            let mut last = self.last_reap.lock();
            match *last {
                Some(at) if at.elapsed() < self.reap_interval => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if !due {
            return;
        }

        match self.leases.reap_expired().await {
            Ok(0) => {}
            Ok(count) => info!(count, "Reaped expired leases"),
            Err(e) => warn!(error = %e, "Failed to reap expired leases"),
        }
    }
}

fn iteration_for(job_id: JobId, outcome: &Outcome) -> Iteration {
    match outcome.job().map(|job| job.status) {
        Some(JobStatus::Completed) => Iteration::Completed(job_id),
        Some(JobStatus::Pending) => Iteration::Retried(job_id),
        Some(JobStatus::Failed) => Iteration::Failed(job_id),
        Some(JobStatus::Processing) | None => Iteration::Rejected(job_id),
    }
}

fn handler_finished(joined: Option<Result<JobResult<()>, JoinError>>) -> JobResult<()> {
    match joined {
        Some(Ok(result)) => result,
        Some(Err(join_error)) => Err(handler_crashed(join_error)),
        None => Err(JobError::Internal("handler task was not spawned".to_string())),
    }
}

fn handler_crashed(err: JoinError) -> JobError {
    if !err.is_panic() {
        return JobError::Handler("handler was cancelled".to_string());
    }

    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    JobError::Handler(format!("handler panicked: {message}"))
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    /// Pool ID.
    pub id: String,

    /// Is running.
    pub running: bool,

    /// Configured concurrency.
    pub concurrency: usize,

    /// Jobs completed.
    pub jobs_completed: u64,

    /// Failed attempts that were scheduled for retry.
    pub jobs_retried: u64,

    /// Jobs failed permanently.
    pub jobs_failed: u64,

    /// Outcomes dropped because the lease had moved on.
    pub jobs_rejected: u64,

    /// Job types being claimed. Empty means all.
    pub job_types: Vec<String>,
}

/// Runs `concurrency` workers until stopped.
#[derive(Debug)]
pub struct WorkerPool {
    id: String,
    leases: LeaseManager,
    reducer: OutcomeReducer,
    handlers: HandlerRegistry,
    config: WorkerPoolConfig,
    shutdown: Shutdown,
    running: AtomicBool,
    counters: Arc<WorkerCounters>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(
        leases: LeaseManager,
        reducer: OutcomeReducer,
        handlers: HandlerRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            id: format!("{}-{}", config.identity_prefix, Uuid::now_v7()),
            leases,
            reducer,
            handlers,
            config,
            shutdown: Shutdown::new(),
            running: AtomicBool::new(false),
            counters: Arc::default(),
        }
    }

    /// Identity of the worker in `slot`.
    pub fn worker_id(&self, slot: usize) -> WorkerId {
        WorkerId::new(format!("{}-{}", self.id, slot))
    }

    /// Runs the pool until [`stop`](Self::stop) is called. A stopped pool
    /// does not restart; build a new one instead.
    ///
    /// After the stop request, in-flight jobs get up to the shutdown timeout
    /// to finish. Whatever is still running then is abandoned; its lease
    /// expires and another worker picks the job up.
    pub async fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Internal("Worker pool already running".to_string()));
        }

        info!(
            pool_id = %self.id,
            concurrency = self.config.concurrency,
            job_types = ?self.config.job_types,
            "Starting worker pool"
        );

        let mut workers = JoinSet::new();
        for slot in 0..self.config.concurrency {
            let worker = Worker::new(
                self.worker_id(slot),
                self.leases.clone(),
                self.reducer.clone(),
                self.handlers.clone(),
                &self.config,
            )
            .in_pool(self.id.clone(), self.counters.clone());
            let signal = self.shutdown.signal();
            workers.spawn(async move { worker.run(signal).await });
        }

        self.shutdown.signal().recv().await;

        info!(pool_id = %self.id, "Waiting for workers to finish...");
        let drained = timeout(self.config.shutdown_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                pool_id = %self.id,
                timeout = ?self.config.shutdown_timeout,
                "Shutdown timeout elapsed, abandoning in-flight jobs"
            );
            workers.abort_all();
        }

        self.running.store(false, Ordering::SeqCst);

        let stats = self.stats();
        info!(
            pool_id = %self.id,
            completed = stats.jobs_completed,
            retried = stats.jobs_retried,
            failed = stats.jobs_failed,
            "Worker pool stopped"
        );

        Ok(())
    }

    /// Stop the worker pool.
    pub fn stop(&self) {
        info!(pool_id = %self.id, "Stopping worker pool...");
        self.shutdown.trigger();
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.id.clone(),
            running: self.is_running(),
            concurrency: self.config.concurrency,
            jobs_completed: self.counters.completed.load(Ordering::Relaxed),
            jobs_retried: self.counters.retried.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_rejected: self.counters.rejected.load(Ordering::Relaxed),
            job_types: self.config.job_types.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_from_worker_config() {
        let worker = WorkerConfig {
            concurrency: 3,
            poll_interval_ms: 250,
            job_types: vec!["license_pdf".to_string()],
            ..WorkerConfig::default()
        };
        let config = WorkerPoolConfig::from(&worker);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.filter(), ClaimFilter::for_types(["license_pdf"]));
        assert_eq!(config.handler_timeout, None);

        let bounded = WorkerPoolConfig::from(&WorkerConfig {
            handler_timeout_secs: 120,
            ..WorkerConfig::default()
        });
        assert_eq!(bounded.handler_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_counters_record_iterations() {
        let counters = WorkerCounters::default();
        let id = JobId::new();
        counters.record(Iteration::Completed(id));
        counters.record(Iteration::Retried(id));
        counters.record(Iteration::LeaseLost(id));
        counters.record(Iteration::Idle);
        assert_eq!(counters.completed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.retried.load(Ordering::Relaxed), 1);
        assert_eq!(counters.failed.load(Ordering::Relaxed), 0);
        assert_eq!(counters.rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_shutdown());

        shutdown.trigger();
        tokio_test::assert_ready!(tokio_test::task::spawn(signal.recv()).poll());
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_handler_crashed_reports_panic_message() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = runtime
            .block_on(runtime.spawn(async { panic!("renderer exploded") }))
            .unwrap_err();
        assert_eq!(
            handler_crashed(err).last_error(),
            "handler panicked: renderer exploded"
        );
    }
}
