//! Wiring for the engine's components.

use crate::clock::{SharedClock, SystemClock};
use crate::error::JobResult;
use crate::events::{NoopEventSink, SharedEventSink};
use crate::handler::HandlerRegistry;
use crate::job::WorkerId;
use crate::lease::LeaseManager;
use crate::queue::JobQueue;
use crate::reducer::OutcomeReducer;
use crate::retry::RetryPolicy;
use crate::store::{connect_store, SharedJobStore};
use crate::worker::{Worker, WorkerPool, WorkerPoolConfig};
use backbeat_config::{AppConfig, JobsConfig};
use std::sync::Arc;
use tracing::info;

/// Owns the store, clock, event sink and handler table, and hands out
/// components that share them.
#[derive(Debug, Clone)]
pub struct JobEngine {
    store: SharedJobStore,
    clock: SharedClock,
    sink: SharedEventSink,
    handlers: HandlerRegistry,
    config: JobsConfig,
}

impl JobEngine {
    /// Creates an engine over `store` with the system clock and no event sink.
    pub fn new(store: SharedJobStore, config: JobsConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            sink: Arc::new(NoopEventSink),
            handlers: HandlerRegistry::new(),
            config,
        }
    }

    /// Opens the configured store (running migrations if enabled) and
    /// builds an engine over it.
    pub async fn connect(config: &AppConfig) -> JobResult<Self> {
        let store = connect_store(&config.database).await?;
        info!(
            lease_secs = config.jobs.lease.duration_secs,
            default_max_attempts = config.jobs.default_max_attempts,
            retry = ?config.jobs.retry.strategy,
            "Job engine ready"
        );
        Ok(Self::new(store, config.jobs.clone()))
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the transition event sink.
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Backing store.
    pub fn store(&self) -> &SharedJobStore {
        &self.store
    }

    /// Engine clock.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Jobs configuration.
    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Handler table shared by every worker this engine builds.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Producer-side queue.
    pub fn queue(&self) -> JobQueue {
        JobQueue::new(
            self.store.clone(),
            self.clock.clone(),
            self.sink.clone(),
            self.config.default_max_attempts,
        )
    }

    /// Lease manager using the configured lease duration.
    pub fn leases(&self) -> LeaseManager {
        LeaseManager::new(
            self.store.clone(),
            self.clock.clone(),
            self.sink.clone(),
            self.config.lease.duration(),
        )
    }

    /// Outcome reducer using the configured retry policy.
    pub fn reducer(&self) -> OutcomeReducer {
        OutcomeReducer::new(
            self.store.clone(),
            self.clock.clone(),
            self.sink.clone(),
            RetryPolicy::from(&self.config.retry),
        )
    }

    /// A single worker with the configured worker settings.
    pub fn worker(&self, id: impl Into<WorkerId>) -> Worker {
        self.worker_with(id, &WorkerPoolConfig::from(&self.config.worker))
    }

    /// A single worker with explicit settings.
    pub fn worker_with(&self, id: impl Into<WorkerId>, config: &WorkerPoolConfig) -> Worker {
        Worker::new(
            id.into(),
            self.leases(),
            self.reducer(),
            self.handlers.clone(),
            config,
        )
    }

    /// A pool with the configured worker settings.
    pub fn worker_pool(&self) -> WorkerPool {
        self.worker_pool_with(WorkerPoolConfig::from(&self.config.worker))
    }

    /// A pool with explicit settings.
    pub fn worker_pool_with(&self, config: WorkerPoolConfig) -> WorkerPool {
        WorkerPool::new(
            self.leases(),
            self.reducer(),
            self.handlers.clone(),
            config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, NewJob, TenantId};
    use crate::worker::Iteration;
    use backbeat_config::DatabaseConfig;
    use serde_json::json;

    fn memory_config() -> AppConfig {
        AppConfig {
            database: DatabaseConfig {
                url: "memory".to_string(),
                ..DatabaseConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_memory_and_process_one_job() {
        let engine = JobEngine::connect(&memory_config()).await.unwrap();
        engine
            .handlers()
            .register_fn("license_pdf", |_ctx| async { Ok(()) });

        let id = engine
            .queue()
            .enqueue(NewJob::new("t1", "license_pdf", json!({"license_id": "L-1"})))
            .await
            .unwrap();

        let worker = engine.worker("w1");
        assert_eq!(worker.run_once().await.unwrap(), Iteration::Completed(id));
        assert_eq!(worker.run_once().await.unwrap(), Iteration::Idle);

        let job = engine.queue().get(&TenantId::from("t1"), id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn test_components_follow_config() {
        let mut config = JobsConfig::default();
        config.lease.duration_secs = 5;
        let engine = JobEngine::new(Arc::new(crate::store::MemoryJobStore::new()), config);

        assert_eq!(engine.leases().lease_duration(), std::time::Duration::from_secs(5));
        assert_eq!(
            engine.reducer().retry_policy().strategy,
            crate::retry::RetryStrategy::None
        );
    }
}
