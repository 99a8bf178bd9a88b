//! Dead-letter inspection and requeue for the admin surface.

use chrono::{DateTime, Utc};
use photoflow_engine::{DlqInspector, FetchedMessage, QueueError};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// How many messages one pull inspects. Messages deeper than this stay
/// invisible until the backlog in front of them drains.
pub const PULL_LIMIT: usize = 100;

/// Admin view of one dead-lettered message.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    /// Broker message id, or a fresh uuid when the producer set none.
    pub id: String,
    /// Queue the message died on.
    pub original_queue: String,
    /// Raw body, lossily decoded for display.
    pub message_body: String,
    /// Producer-supplied error reason, when present.
    pub error_reason: String,
    /// When the message first died.
    pub failed_at: DateTime<Utc>,
    /// Broker death count.
    pub retry_count: i64,
    /// Last manual requeue, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
}

fn failed_job_from_parts(
    body: &[u8],
    message_id: Option<&str>,
    origin_queue: Option<&str>,
    death_count: Option<i64>,
    died_at: Option<i64>,
    error_reason: Option<&str>,
    default_queue: &str,
) -> FailedJob {
    FailedJob {
        id: message_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        original_queue: origin_queue.unwrap_or(default_queue).to_string(),
        message_body: String::from_utf8_lossy(body).into_owned(),
        error_reason: error_reason.unwrap_or("unknown").to_string(),
        failed_at: died_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(Utc::now),
        retry_count: death_count.unwrap_or(0),
        last_retry_at: None,
    }
}

fn decode(message: &FetchedMessage, default_queue: &str) -> FailedJob {
    failed_job_from_parts(
        &message.body,
        message.message_id.as_deref(),
        message.origin_queue.as_deref(),
        message.death_count,
        message.died_at,
        message.error_reason.as_deref(),
        default_queue,
    )
}

/// Backs the `/admin/failed-jobs` endpoints.
pub struct DlqAdmin {
    inspector: DlqInspector,
    default_queue: String,
}

impl DlqAdmin {
    /// Wire the admin to a connected DLQ inspector. `default_queue` receives
    /// requeued messages whose death headers name no origin.
    pub fn new(inspector: DlqInspector, default_queue: impl Into<String>) -> Self {
        Self {
            inspector,
            default_queue: default_queue.into(),
        }
    }

    /// Inspect the backlog without draining it: pull, decode, put back.
    pub async fn list(&self) -> Result<Vec<FailedJob>, QueueError> {
        let messages = self.inspector.get_messages(PULL_LIMIT).await?;
        let mut jobs = Vec::with_capacity(messages.len());
        for message in messages {
            jobs.push(decode(&message, &self.default_queue));
            message.nack_requeue().await?;
        }
        Ok(jobs)
    }

    /// Requeue the message matching `job_id` onto its origin queue. Every
    /// other pulled message goes back to the DLQ. Returns the origin queue,
    /// or None when no pulled message matched.
    pub async fn requeue(&self, job_id: &str) -> Result<Option<String>, QueueError> {
        let messages = self.inspector.get_messages(PULL_LIMIT).await?;
        let mut matched = None;

        for message in messages {
            let job = decode(&message, &self.default_queue);
            if matched.is_none() && job.id == job_id {
                self.inspector.requeue(&job.original_queue, &message.body).await?;
                message.ack().await?;
                info!(job_id, queue = %job.original_queue, "requeued dead-lettered message");
                matched = Some(job.original_queue);
            } else {
                message.nack_requeue().await?;
            }
        }

        if matched.is_none() {
            warn!(job_id, "requeue target not found in current pull");
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoded_job_prefers_broker_fields() {
        let job = failed_job_from_parts(
            br#"{"trace_id":"t-1"}"#,
            Some("msg-7"),
            Some("metadata_generated"),
            Some(3),
            Some(1_700_000_000),
            Some("vision exhausted"),
            "image_upload",
        );
        assert_eq!(job.id, "msg-7");
        assert_eq!(job.original_queue, "metadata_generated");
        assert_eq!(job.retry_count, 3);
        assert_eq!(job.error_reason, "vision exhausted");
        assert_eq!(job.failed_at.timestamp(), 1_700_000_000);
        assert!(job.message_body.contains("t-1"));
    }

    #[test]
    fn missing_fields_fall_back() {
        let job = failed_job_from_parts(b"body", None, None, None, None, None, "image_upload");
        assert_eq!(job.original_queue, "image_upload");
        assert_eq!(job.error_reason, "unknown");
        assert_eq!(job.retry_count, 0);
        // Fallback ids are fresh uuids.
        assert_eq!(job.id.len(), 36);
        let again = failed_job_from_parts(b"body", None, None, None, None, None, "image_upload");
        assert_ne!(job.id, again.id);
    }
}
