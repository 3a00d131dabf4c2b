//! Backbeat Jobs - Leased Background Job Engine
//!
//! A durable, multi-tenant job engine with at-least-once execution:
//! - Jobs persisted in SQLite, PostgreSQL or memory
//! - Exclusive time-bounded leases with atomic claims
//! - Crash recovery by reclaiming expired leases
//! - Zombie-write protection on every outcome report
//! - Bounded attempts with optional backoff between retries
//! - Typed handlers with panic and timeout containment
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Backbeat Jobs Architecture                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producer ──► JobQueue::enqueue                                  │
//! │                    │                                             │
//! │                    ▼                                             │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                   JobStore (jobs table)                  │    │
//! │  │   pending ──claim──► processing ──┬──► completed         │    │
//! │  │      ▲                   │        └──► failed            │    │
//! │  │      └──── retry ────────┘                               │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │         ▲ claim / renew / reap            ▲ complete / fail      │
//! │         │                                 │                      │
//! │  ┌──────┴───────┐                 ┌───────┴────────┐             │
//! │  │ LeaseManager │                 │ OutcomeReducer │             │
//! │  └──────┬───────┘                 └───────▲────────┘             │
//! │         │                                 │                      │
//! │  ┌──────┴─────────────────────────────────┴───────────────┐     │
//! │  │                     Worker Pool                         │     │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐   │     │
//! │  │  │ Worker 0 │ │ Worker 1 │ │ Worker 2 │ │ Worker N │   │     │
//! │  │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────┬─────┘   │     │
//! │  │       └────────────┴─────┬──────┴────────────┘         │     │
//! │  │                          ▼                              │     │
//! │  │                  HandlerRegistry                        │     │
//! │  └─────────────────────────────────────────────────────────┘     │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use backbeat_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct LicensePdf {
//!     license_id: String,
//! }
//!
//! impl JobPayload for LicensePdf {
//!     const JOB_TYPE: &'static str = "license_pdf";
//!     const MAX_ATTEMPTS: Option<u32> = Some(3);
//! }
//!
//! let engine = JobEngine::connect(&config).await?;
//!
//! engine.handlers().register_typed::<LicensePdf, _, _>(|job, ctx| async move {
//!     render_license(&job.license_id).await.map_err(JobError::handler)?;
//!     Ok(())
//! });
//!
//! engine
//!     .queue()
//!     .enqueue_typed("tenant-a", &LicensePdf { license_id: "L-1".into() })
//!     .await?;
//!
//! let pool = engine.worker_pool();
//! pool.start().await?;
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod lease;
pub mod metrics;
pub mod queue;
pub mod reducer;
pub mod retry;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use engine::JobEngine;
pub use error::{JobError, JobResult};
pub use events::{EventSink, MemoryEventSink, NoopEventSink, SharedEventSink, TracingEventSink, TransitionEvent};
pub use handler::{HandlerRegistry, JobContext, JobHandler, LeaseHandle};
pub use job::{
    ClaimFilter, Job, JobId, JobPayload, JobQuery, JobStatus, NewJob, StatusCounts, TenantId, WorkerId,
};
pub use lease::{ClaimOutcome, LeaseManager};
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use queue::JobQueue;
pub use reducer::{Outcome, OutcomeReducer};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::{
    connect_store, JobStore, MemoryJobStore, PostgresJobStore, SharedJobStore, SqliteJobStore,
};
pub use worker::{Iteration, Shutdown, ShutdownSignal, Worker, WorkerPool, WorkerPoolConfig, WorkerPoolStats};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::engine::JobEngine;
    pub use crate::handler::{JobContext, JobHandler};
    pub use crate::job::{JobPayload, JobStatus, NewJob};
    pub use crate::retry::RetryPolicy;
    pub use crate::worker::{Worker, WorkerPool};
    pub use crate::{JobError, JobId, JobResult};
}
