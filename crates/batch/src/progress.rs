//! Per-job progress fan-out.
//!
//! Subscribers attach per job id and get an owned bounded buffer. A
//! subscriber that stops draining is dropped rather than back-pressuring
//! the publisher.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::job::{BatchImageStatus, BatchJob, JobStatus};

/// Per-subscriber buffer depth.
const SUBSCRIBER_BUFFER: usize = 32;

/// Kind of progress event.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    /// Any status change.
    Progress,
    /// One image reached a terminal state; `image` is set.
    ImageComplete,
    /// The job reached a terminal state.
    JobComplete,
}

/// One event on a progress subscription.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: ProgressEventKind,
    /// Job handle.
    pub job_id: String,
    /// Job status after the change.
    pub status: JobStatus,
    /// Finished share in percent.
    pub progress: u8,
    /// Completed count.
    pub completed: usize,
    /// Failed count.
    pub failed: usize,
    /// Total images.
    pub total: usize,
    /// The image that changed, for `image_complete`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<BatchImageStatus>,
    /// Emit time.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Build an event from a job snapshot.
    pub fn for_job(kind: ProgressEventKind, job: &BatchJob, image: Option<BatchImageStatus>) -> Self {
        Self {
            kind,
            job_id: job.job_id.clone(),
            status: job.status,
            progress: job.progress_percent(),
            completed: job.completed,
            failed: job.failed,
            total: job.total,
            image,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out hub: `job_id -> live subscriber senders`.
#[derive(Default)]
pub struct ProgressBroadcaster {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<ProgressEvent>>>>,
}

impl ProgressBroadcaster {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber to a job.
    pub fn subscribe(&self, job_id: &str) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .entry(job_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber of its job. Full or closed
    /// subscribers are dropped on the spot.
    pub fn publish(&self, event: ProgressEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        let Some(senders) = subscribers.get_mut(&event.job_id) else {
            return;
        };

        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(job_id = %event.job_id, "dropping slow progress subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            subscribers.remove(&event.job_id);
        }
    }

    /// Drop every subscriber of a job (eviction, shutdown).
    pub fn drop_job(&self, job_id: &str) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> BatchJob {
        let mut job = BatchJob::new("job-1".to_string(), 2);
        job.completed = 1;
        job
    }

    #[tokio::test]
    async fn subscribers_receive_events_for_their_job() {
        let hub = ProgressBroadcaster::new();
        let mut rx = hub.subscribe("job-1");
        let mut other = hub.subscribe("job-2");

        hub.publish(ProgressEvent::for_job(ProgressEventKind::Progress, &job(), None));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ProgressEventKind::Progress);
        assert_eq!(event.progress, 50);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscribers_are_dropped_not_awaited() {
        let hub = ProgressBroadcaster::new();
        let mut rx = hub.subscribe("job-1");

        for _ in 0..(SUBSCRIBER_BUFFER + 5) {
            hub.publish(ProgressEvent::for_job(ProgressEventKind::Progress, &job(), None));
        }

        // The buffer filled up and the subscriber was dropped; the channel
        // closes once the sender side is gone.
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[test]
    fn event_json_shape() {
        let event = ProgressEvent::for_job(ProgressEventKind::JobComplete, &job(), None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_complete");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["completed"], 1);
        assert!(json.get("image").is_none());
    }
}
