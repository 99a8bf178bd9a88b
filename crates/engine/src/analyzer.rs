//! Analyzer stage: upload envelope in, generated-metadata envelope out.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use metrics::counter;
use photoflow_core::{ImageUpload, MetadataGenerated};
use photoflow_vision::VisionApi;
use tracing::{info, warn};

use crate::storage::ObjectStorage;
use crate::worker::{MessageHandler, MessagePublisher, ModelSource, WorkerConfig};

/// Consumes `image_upload`, optimizes the bytes, asks the vision model for
/// metadata, and publishes `metadata_generated`.
pub struct Analyzer {
    storage: Arc<dyn ObjectStorage>,
    vision: Arc<dyn VisionApi>,
    models: Arc<dyn ModelSource>,
    publisher: Arc<dyn MessagePublisher>,
    config: WorkerConfig,
}

impl Analyzer {
    /// Wire an analyzer stage.
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        vision: Arc<dyn VisionApi>,
        models: Arc<dyn ModelSource>,
        publisher: Arc<dyn MessagePublisher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            storage,
            vision,
            models,
            publisher,
            config,
        }
    }

    async fn process_with_retries(&self, upload: &ImageUpload) -> anyhow::Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.process_once(upload).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.max_retries => {
                    counter!("photoflow_worker_retries_total", "stage" => "analyzer").increment(1);
                    warn!(
                        trace_id = %upload.trace_id,
                        attempt,
                        max_retries = self.config.max_retries,
                        "analysis attempt failed, retrying in {:?}: {err:#}",
                        self.config.retry_delay
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(err) => {
                    return Err(err.context(format!("analysis exhausted after {attempt} attempts")));
                }
            }
        }
    }

    async fn process_once(&self, upload: &ImageUpload) -> anyhow::Result<()> {
        let bytes = self
            .storage
            .download(self.storage.original_bucket(), &upload.original_path)
            .await?;

        // The optimizer is pure CPU; keep it off the runtime threads.
        let optimized = tokio::task::spawn_blocking(move || photoflow_optimize::optimize(&bytes))
            .await
            .context("optimizer task")??;
        if optimized.was_converted {
            counter!("photoflow_png_conversions_total").increment(1);
        }
        info!(
            trace_id = %upload.trace_id,
            original_size = optimized.original_size,
            optimized_size = optimized.optimized_size,
            resized = optimized.was_resized,
            converted = optimized.was_converted,
            "image optimized"
        );

        let model = self.models.current_model()?;
        let metadata = self
            .vision
            .analyze_image(&optimized.bytes, &model, &upload.trace_id)
            .await?;
        counter!("photoflow_vision_calls_total", "outcome" => "ok").increment(1);

        let generated = MetadataGenerated::from_upload(upload, metadata);
        let payload = serde_json::to_vec(&generated).context("serialize metadata envelope")?;
        self.publisher.publish(&payload).await?;
        info!(trace_id = %upload.trace_id, model, "metadata generated");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Analyzer {
    async fn handle(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        // A malformed envelope never gets better; fail it straight back to
        // the broker's redelivery policy.
        let upload: ImageUpload =
            serde_json::from_slice(&payload).context("parse image-upload envelope")?;

        tokio::time::timeout(
            self.config.message_deadline,
            self.process_with_retries(&upload),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "analysis deadline of {:?} exceeded for trace {}",
                self.config.message_deadline,
                upload.trace_id
            )
        })?
    }
}
