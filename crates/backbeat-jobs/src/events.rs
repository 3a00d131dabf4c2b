//! Job state transition events.

use crate::job::{Job, JobId, JobStatus, TenantId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

/// Emitted on every job state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub job_type: String,
    /// `None` when the job was just created.
    pub from_status: Option<JobStatus>,
    pub to_status: JobStatus,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl TransitionEvent {
    /// Builds the event for `job` having moved out of `from`.
    pub fn for_job(job: &Job, from_status: Option<JobStatus>, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            job_type: job.job_type.clone(),
            from_status,
            to_status: job.status,
            attempts: job.attempts,
            timestamp,
        }
    }
}

/// Receives transition events.
///
/// Called inline on the engine's path, so implementations must not block.
pub trait EventSink: Send + Sync + Debug {
    fn emit(&self, event: &TransitionEvent);
}

/// Shared sink handle.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &TransitionEvent) {}
}

/// Logs each event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &TransitionEvent) {
        info!(
            job_id = %event.job_id,
            tenant_id = %event.tenant_id,
            job_type = %event.job_type,
            from_status = event.from_status.map_or("none", |s| s.as_str()),
            to_status = %event.to_status,
            attempts = event.attempts,
            timestamp = %event.timestamp,
            "Job transition"
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<TransitionEvent>>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything captured so far.
    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().clone()
    }

    /// Returns the captured events for one job, oldest first.
    pub fn events_for(&self, job_id: JobId) -> Vec<TransitionEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Drops all captured events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &TransitionEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJobRecord;
    use serde_json::json;

    fn job() -> Job {
        NewJobRecord {
            id: JobId::new(),
            tenant_id: TenantId::from("t1"),
            job_type: "preview_generate".to_string(),
            payload: json!({}),
            max_attempts: 5,
            not_before_at: None,
            created_at: Utc::now(),
        }
        .into_job()
    }

    #[test]
    fn test_event_for_new_job() {
        let job = job();
        let event = TransitionEvent::for_job(&job, None, job.created_at);
        assert_eq!(event.from_status, None);
        assert_eq!(event.to_status, JobStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert_eq!(event.tenant_id.as_str(), "t1");
    }

    #[test]
    fn test_memory_sink_captures_in_order() {
        let sink = MemoryEventSink::new();
        let first = job();
        let second = job();

        sink.emit(&TransitionEvent::for_job(&first, None, Utc::now()));
        sink.emit(&TransitionEvent::for_job(&second, None, Utc::now()));
        sink.emit(&TransitionEvent::for_job(
            &first,
            Some(JobStatus::Pending),
            Utc::now(),
        ));

        assert_eq!(sink.events().len(), 3);
        let for_first = sink.events_for(first.id);
        assert_eq!(for_first.len(), 2);
        assert_eq!(for_first[1].from_status, Some(JobStatus::Pending));

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_memory_sink_clones_share_storage() {
        let sink = MemoryEventSink::new();
        let shared: SharedEventSink = Arc::new(sink.clone());
        shared.emit(&TransitionEvent::for_job(&job(), None, Utc::now()));
        assert_eq!(sink.events().len(), 1);
    }
}
