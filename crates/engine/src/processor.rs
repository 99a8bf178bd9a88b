//! Processor stage: generated-metadata envelope in, tagged object plus
//! terminal `image_processed` envelope out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use metrics::counter;
use photoflow_core::{ImageProcessed, MetadataGenerated};
use photoflow_exiftool::ExifTool;
use tracing::{error, info, warn};

use crate::storage::{ObjectStorage, content_type_for};
use crate::worker::{MessageHandler, MessagePublisher, WorkerConfig};

/// Consumes `metadata_generated`, embeds the tags with exiftool, uploads the
/// result, and always emits a terminal `image_processed` envelope.
pub struct Processor {
    storage: Arc<dyn ObjectStorage>,
    exiftool: ExifTool,
    publisher: Arc<dyn MessagePublisher>,
    temp_dir: PathBuf,
    config: WorkerConfig,
}

/// Scoped temp file; removed on every exit path.
struct TempFile {
    path: PathBuf,
}

impl TempFile {
    async fn write(path: PathBuf, bytes: &[u8]) -> std::io::Result<Self> {
        tokio::fs::write(&path, bytes).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Processor {
    /// Wire a processor stage. `temp_dir` must exist and be writable.
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        exiftool: ExifTool,
        publisher: Arc<dyn MessagePublisher>,
        temp_dir: PathBuf,
        config: WorkerConfig,
    ) -> Self {
        Self {
            storage,
            exiftool,
            publisher,
            temp_dir,
            config,
        }
    }

    fn processed_path(generated: &MetadataGenerated) -> String {
        format!(
            "processed/{}/{}",
            generated.trace_id, generated.original_filename
        )
    }

    async fn process_with_retries(&self, generated: &MetadataGenerated) -> anyhow::Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.process_once(generated).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.max_retries => {
                    counter!("photoflow_worker_retries_total", "stage" => "processor").increment(1);
                    warn!(
                        trace_id = %generated.trace_id,
                        attempt,
                        max_retries = self.config.max_retries,
                        "processing attempt failed, retrying in {:?}: {err:#}",
                        self.config.retry_delay
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(err) => {
                    return Err(
                        err.context(format!("processing exhausted after {attempt} attempts"))
                    );
                }
            }
        }
    }

    async fn process_once(&self, generated: &MetadataGenerated) -> anyhow::Result<()> {
        let processed_path = Self::processed_path(generated);
        let bytes = self
            .storage
            .download(self.storage.original_bucket(), &generated.original_path)
            .await?;

        let temp_path = self
            .temp_dir
            .join(format!("{}_temp.jpg", generated.trace_id));
        let temp = TempFile::write(temp_path, &bytes)
            .await
            .context("write temp image")?;

        self.exiftool
            .write_metadata(temp.path(), &generated.metadata)
            .await?;

        // Verification is advisory; a tagged file that reads back oddly
        // still ships.
        match self.exiftool.verify_metadata(temp.path()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(trace_id = %generated.trace_id, "metadata verification read back empty")
            }
            Err(err) => {
                warn!(trace_id = %generated.trace_id, "metadata verification failed: {err}")
            }
        }

        let tagged = tokio::fs::read(temp.path())
            .await
            .context("read tagged image")?;
        self.storage
            .upload(
                self.storage.processed_bucket(),
                &processed_path,
                tagged,
                content_type_for(&generated.original_filename),
            )
            .await?;

        let envelope = ImageProcessed::completed(generated, processed_path.clone());
        let payload = serde_json::to_vec(&envelope).context("serialize processed envelope")?;
        self.publisher.publish(&payload).await?;
        info!(trace_id = %generated.trace_id, processed_path, "image processed");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Processor {
    async fn handle(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let generated: MetadataGenerated =
            serde_json::from_slice(&payload).context("parse generated-metadata envelope")?;

        let outcome = match tokio::time::timeout(
            self.config.message_deadline,
            self.process_with_retries(&generated),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!(
                "processing deadline of {:?} exceeded",
                self.config.message_deadline
            )),
        };

        // The downstream consumer hears about this image either way: a
        // failure becomes a terminal failed envelope, and the input acks.
        if let Err(err) = outcome {
            error!(trace_id = %generated.trace_id, "processing failed: {err:#}");
            counter!("photoflow_processed_total", "outcome" => "failed").increment(1);
            let envelope = ImageProcessed::failed(&generated, format!("{err:#}"));
            let payload = serde_json::to_vec(&envelope).context("serialize failed envelope")?;
            self.publisher.publish(&payload).await?;
        } else {
            counter!("photoflow_processed_total", "outcome" => "completed").increment(1);
        }
        Ok(())
    }
}
