//! Batch creation and fan-out, plus correlation of terminal pipeline
//! envelopes back into job state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use metrics::counter;
use photoflow_core::{ImageProcessed, ImageUpload, ProcessingStatus, ids};
use photoflow_engine::storage::content_type_for;
use photoflow_engine::{MessageHandler, MessagePublisher, ObjectStorage};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::job::{BatchImageStatus, BatchJob, ImageOutcome, JobStore};
use crate::progress::{ProgressBroadcaster, ProgressEvent, ProgressEventKind};

/// Fan-out limits.
#[derive(Debug, Clone)]
pub struct BatchLimits {
    /// Maximum sources per request.
    pub max_sources: usize,
    /// Per-URL fetch timeout.
    pub fetch_timeout: Duration,
    /// Per-URL body cap, bytes.
    pub max_fetch_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_sources: 100,
            fetch_timeout: Duration::from_secs(30),
            max_fetch_bytes: 10 * 1024 * 1024,
        }
    }
}

/// One submitted source: exactly one of `url` or `base64`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSource {
    /// Fetch the image from here.
    pub url: Option<String>,
    /// Or take it inline, optionally with a `data:…;base64,` prefix.
    pub base64: Option<String>,
    /// Optional filename; synthesized when absent.
    pub name: Option<String>,
}

/// The create-batch request body.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    /// Sources to ingest.
    pub sources: Vec<BatchSource>,
}

/// Request-validation failures, mapped to 400 by the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum BatchRequestError {
    /// No sources at all.
    #[error("sources must not be empty")]
    Empty,
    /// Over the per-request cap.
    #[error("too many sources: {got} (limit {limit})")]
    TooMany {
        /// Submitted count.
        got: usize,
        /// Allowed maximum.
        limit: usize,
    },
    /// A source with both or neither of `url`/`base64`.
    #[error("source {index}: provide exactly one of url or base64")]
    AmbiguousSource {
        /// Offending source index.
        index: usize,
    },
}

/// Owns batch jobs end to end: creation, fan-out into the pipeline, and
/// correlation of `image_processed` envelopes.
#[derive(Clone)]
pub struct BatchCoordinator {
    jobs: Arc<JobStore>,
    progress: Arc<ProgressBroadcaster>,
    storage: Arc<dyn ObjectStorage>,
    publisher: Arc<dyn MessagePublisher>,
    http: reqwest::Client,
    limits: BatchLimits,
    shutdown: watch::Receiver<bool>,
}

impl BatchCoordinator {
    /// Wire a coordinator. `publisher` must be bound to the upload queue.
    pub fn new(
        jobs: Arc<JobStore>,
        progress: Arc<ProgressBroadcaster>,
        storage: Arc<dyn ObjectStorage>,
        publisher: Arc<dyn MessagePublisher>,
        limits: BatchLimits,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(limits.fetch_timeout)
            .build()
            .context("build batch http client")?;
        Ok(Self {
            jobs,
            progress,
            storage,
            publisher,
            http,
            limits,
            shutdown,
        })
    }

    fn validate(&self, request: &BatchRequest) -> Result<(), BatchRequestError> {
        if request.sources.is_empty() {
            return Err(BatchRequestError::Empty);
        }
        if request.sources.len() > self.limits.max_sources {
            return Err(BatchRequestError::TooMany {
                got: request.sources.len(),
                limit: self.limits.max_sources,
            });
        }
        for (index, source) in request.sources.iter().enumerate() {
            let has_url = source.url.as_deref().is_some_and(|u| !u.is_empty());
            let has_b64 = source.base64.as_deref().is_some_and(|b| !b.is_empty());
            if has_url == has_b64 {
                return Err(BatchRequestError::AmbiguousSource { index });
            }
        }
        Ok(())
    }

    /// Validate, register the job, and spawn the fan-out. Returns the job
    /// snapshot to answer the HTTP request with; ingestion continues in the
    /// background.
    pub fn create_batch(&self, request: BatchRequest) -> Result<BatchJob, BatchRequestError> {
        self.validate(&request)?;

        let job_id = Uuid::new_v4().to_string();
        let job = BatchJob::new(job_id.clone(), request.sources.len());
        let snapshot = job.clone();
        self.jobs.insert(job);
        counter!("photoflow_batch_jobs_total").increment(1);
        info!(job_id, sources = request.sources.len(), "batch job created");

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.fan_out(job_id, request.sources).await;
        });

        Ok(snapshot)
    }

    async fn fan_out(self, job_id: String, sources: Vec<BatchSource>) {
        for (index, source) in sources.into_iter().enumerate() {
            if *self.shutdown.borrow() {
                info!(job_id, index, "shutdown requested, stopping batch fan-out");
                break;
            }

            let trace_id = ids::new_trace_id();
            let filename = synthesized_filename(&source, index, &trace_id);
            let slot = BatchImageStatus::pending(index, filename.clone(), trace_id.clone());
            let Some(job) = self.jobs.add_image(&job_id, slot) else {
                // Evicted while we were fanning out; nothing to track.
                return;
            };
            self.progress
                .publish(ProgressEvent::for_job(ProgressEventKind::Progress, &job, None));

            match self.ingest(&job_id, &trace_id, &filename, source).await {
                Ok(()) => {
                    counter!("photoflow_batch_sources_total", "outcome" => "published")
                        .increment(1);
                    if let Some(update) = self.jobs.mark_image_processing(&job_id, &trace_id) {
                        self.progress.publish(ProgressEvent::for_job(
                            ProgressEventKind::Progress,
                            &update.job,
                            None,
                        ));
                    }
                }
                Err(err) => {
                    counter!("photoflow_batch_sources_total", "outcome" => "failed").increment(1);
                    warn!(job_id, trace_id, index, "batch source failed: {err:#}");
                    if let Some(update) =
                        self.jobs
                            .mark_image_failed(&job_id, &trace_id, format!("{err:#}"))
                    {
                        self.publish_terminal_events(update);
                    }
                }
            }
        }
    }

    async fn ingest(
        &self,
        job_id: &str,
        trace_id: &str,
        filename: &str,
        source: BatchSource,
    ) -> anyhow::Result<()> {
        let bytes = match (&source.url, &source.base64) {
            (Some(url), _) if !url.is_empty() => self.fetch_url(url).await?,
            (_, Some(b64)) => decode_base64_source(b64)?,
            _ => anyhow::bail!("source has neither url nor base64"),
        };

        let key = format!("{trace_id}/{filename}");
        self.storage
            .upload(
                self.storage.original_bucket(),
                &key,
                bytes,
                content_type_for(filename),
            )
            .await?;

        let upload = ImageUpload {
            timestamp: Utc::now(),
            trace_id: trace_id.to_string(),
            // The job scopes the group: every image of one batch shares it.
            group_id: job_id.to_string(),
            telegram_username: String::new(),
            original_filename: filename.to_string(),
            original_path: key,
            telegram_id: 0,
        };
        let payload = serde_json::to_vec(&upload).context("serialize upload envelope")?;
        self.publisher.publish(&payload).await?;
        info!(job_id, trace_id, filename, "batch image entered the pipeline");
        Ok(())
    }

    async fn fetch_url(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetch {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("fetch {url}: http {status}");
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("image/") {
            anyhow::bail!("fetch {url}: not an image (content-type {content_type:?})");
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.limits.max_fetch_bytes {
                anyhow::bail!(
                    "fetch {url}: {length} bytes exceeds the {} byte limit",
                    self.limits.max_fetch_bytes
                );
            }
        }

        let bytes = response.bytes().await.with_context(|| format!("read {url}"))?;
        if bytes.len() > self.limits.max_fetch_bytes {
            anyhow::bail!(
                "fetch {url}: {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.limits.max_fetch_bytes
            );
        }
        Ok(bytes.to_vec())
    }

    fn publish_terminal_events(&self, update: crate::job::AppliedUpdate) {
        self.progress.publish(ProgressEvent::for_job(
            ProgressEventKind::Progress,
            &update.job,
            None,
        ));
        self.progress.publish(ProgressEvent::for_job(
            ProgressEventKind::ImageComplete,
            &update.job,
            Some(update.image.clone()),
        ));
        if update.job_just_completed {
            info!(
                job_id = %update.job.job_id,
                status = ?update.job.status,
                completed = update.job.completed,
                failed = update.job.failed,
                "batch job finished"
            );
            self.progress.publish(ProgressEvent::for_job(
                ProgressEventKind::JobComplete,
                &update.job,
                None,
            ));
        }
    }
}

/// The coordinator consumes `image_processed` and correlates by trace id.
/// Envelopes that match no open job (user-origin traffic, evicted jobs) ack
/// silently.
#[async_trait]
impl MessageHandler for BatchCoordinator {
    async fn handle(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let processed: ImageProcessed =
            serde_json::from_slice(&payload).context("parse image-processed envelope")?;

        let outcome = ImageOutcome {
            trace_id: processed.trace_id.clone(),
            completed: processed.status == ProcessingStatus::Completed,
            processed_path: (!processed.processed_path.is_empty())
                .then(|| processed.processed_path.clone()),
            error: processed.error.clone(),
        };

        if let Some(update) = self.jobs.apply_outcome(&outcome) {
            self.publish_terminal_events(update);
        }
        Ok(())
    }
}

fn synthesized_filename(source: &BatchSource, index: usize, trace_id: &str) -> String {
    if let Some(name) = source.name.as_deref() {
        if !name.is_empty() {
            return name.to_string();
        }
    }
    let prefix = if source.url.as_deref().is_some_and(|u| !u.is_empty()) {
        "url"
    } else {
        "base64"
    };
    format!("{prefix}_image_{index}_{}.jpg", ids::short(trace_id))
}

/// Decode an inline source, stripping any `data:…;base64,` prefix.
fn decode_base64_source(input: &str) -> anyhow::Result<Vec<u8>> {
    let raw = match input.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => input,
    };
    B64.decode(raw.trim()).context("decode base64 source")
}
