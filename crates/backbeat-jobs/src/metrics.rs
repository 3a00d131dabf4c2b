//! Metrics for job engine monitoring.
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding application.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job engine.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "backbeat_jobs_enqueued_total";
    /// Total successful claims.
    pub const JOBS_CLAIMED_TOTAL: &str = "backbeat_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "backbeat_jobs_completed_total";
    /// Total failures that sent a job back to pending.
    pub const JOBS_RETRIED_TOTAL: &str = "backbeat_jobs_retried_total";
    /// Total jobs moved to the terminal failed state.
    pub const JOBS_FAILED_TOTAL: &str = "backbeat_jobs_failed_total";
    /// Total outcome reports rejected because the caller lost the lease.
    pub const ZOMBIE_WRITES_TOTAL: &str = "backbeat_jobs_zombie_writes_total";
    /// Total expired, exhausted leases failed by the reaper.
    pub const LEASES_REAPED_TOTAL: &str = "backbeat_jobs_leases_reaped_total";

    /// Handler execution duration in seconds.
    pub const HANDLER_DURATION_SECONDS: &str = "backbeat_jobs_handler_duration_seconds";

    /// Jobs currently executing in a worker pool.
    pub const WORKERS_ACTIVE: &str = "backbeat_workers_active";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_CLAIMED_TOTAL, "Total number of successful claims");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed attempts returned to pending"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs that reached the failed state"
    );
    describe_counter!(
        names::ZOMBIE_WRITES_TOTAL,
        "Total number of outcome reports rejected for lost leases"
    );
    describe_counter!(
        names::LEASES_REAPED_TOTAL,
        "Total number of expired leases failed by the reaper"
    );
    describe_histogram!(
        names::HANDLER_DURATION_SECONDS,
        "Job handler execution duration in seconds"
    );
    describe_gauge!(names::WORKERS_ACTIVE, "Number of jobs currently executing");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(job_type: &str) {
        counter!(names::JOBS_ENQUEUED_TOTAL, "job_type" => job_type.to_string()).increment(1);
    }

    /// Record a claim.
    pub fn job_claimed(job_type: &str, reclaimed: bool) {
        counter!(
            names::JOBS_CLAIMED_TOTAL,
            "job_type" => job_type.to_string(),
            "reclaimed" => reclaimed.to_string()
        )
        .increment(1);
    }

    /// Record a completion.
    pub fn job_completed(job_type: &str) {
        counter!(names::JOBS_COMPLETED_TOTAL, "job_type" => job_type.to_string()).increment(1);
    }

    /// Record a failed attempt that will be retried.
    pub fn job_retried(job_type: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "job_type" => job_type.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a terminal failure.
    pub fn job_failed(job_type: &str, reason: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "job_type" => job_type.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Record a rejected outcome report.
    pub fn zombie_write(operation: &'static str) {
        counter!(names::ZOMBIE_WRITES_TOTAL, "operation" => operation).increment(1);
    }

    /// Record reaped leases.
    pub fn leases_reaped(count: usize) {
        counter!(names::LEASES_REAPED_TOTAL).increment(count as u64);
    }

    /// Record handler execution time.
    pub fn handler_duration(job_type: &str, outcome: &'static str, duration: Duration) {
        histogram!(
            names::HANDLER_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// A slot picked up a job.
    pub fn job_started(pool_id: &str) {
        gauge!(names::WORKERS_ACTIVE, "pool_id" => pool_id.to_string()).increment(1.0);
    }

    /// A slot finished a job.
    pub fn job_finished(pool_id: &str) {
        gauge!(names::WORKERS_ACTIVE, "pool_id" => pool_id.to_string()).decrement(1.0);
    }
}
