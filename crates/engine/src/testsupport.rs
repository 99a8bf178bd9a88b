//! In-memory stand-ins for the broker, store, and vision backends.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use photoflow_core::{ImageMetadata, ImageUpload};
use photoflow_vision::{Model, VisionApi, VisionError};

use crate::queue::QueueError;
use crate::storage::{ObjectStorage, StorageError};
use crate::worker::{MessagePublisher, ModelSource};

#[derive(Default)]
pub(crate) struct MemoryStorage {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStorage {
    pub(crate) fn with_object(bucket: &str, key: &str, bytes: Vec<u8>) -> Arc<Self> {
        let storage = Self::default();
        storage
            .objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), bytes);
        Arc::new(storage)
    }

    pub(crate) fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.get(bucket, key).ok_or_else(|| StorageError::Operation {
            op: "download",
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: "no such object".to_string(),
        })
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    fn original_bucket(&self) -> &str {
        "original"
    }

    fn processed_bucket(&self) -> &str {
        "processed"
    }
}

#[derive(Default)]
pub(crate) struct RecordingPublisher {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingPublisher {
    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

/// Vision stub that fails the first `fail_first` calls with a transient
/// server error, then succeeds with fixed metadata.
pub(crate) struct ScriptedVision {
    fail_first: u32,
    calls: AtomicU32,
}

impl ScriptedVision {
    pub(crate) fn succeeding() -> Arc<Self> {
        Self::failing_first(0)
    }

    pub(crate) fn failing_first(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn always_failing() -> Arc<Self> {
        Self::failing_first(u32::MAX)
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionApi for ScriptedVision {
    async fn analyze_image(
        &self,
        _image: &[u8],
        _model: &str,
        _trace_id: &str,
    ) -> Result<ImageMetadata, VisionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(VisionError::Server {
                status: 503,
                body: "scripted failure".to_string(),
            });
        }
        Ok(ImageMetadata {
            title: "Test Title".to_string(),
            description: "Test Description".to_string(),
            keywords: vec![
                "test".to_string(),
                "image".to_string(),
                "analysis".to_string(),
            ],
        })
    }

    async fn list_models(&self) -> Result<Vec<Model>, VisionError> {
        Ok(Vec::new())
    }
}

pub(crate) struct FixedModel(pub(crate) String);

impl ModelSource for FixedModel {
    fn current_model(&self) -> Result<String, VisionError> {
        Ok(self.0.clone())
    }
}

/// A 500×500 JPEG small enough to pass through the optimizer untouched.
pub(crate) fn small_jpeg() -> Vec<u8> {
    let img = image::RgbImage::from_fn(500, 500, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = Vec::new();
    img.write_with_encoder(image::codecs::jpeg::JpegEncoder::new_with_quality(
        Cursor::new(&mut out),
        90,
    ))
    .unwrap();
    out
}

pub(crate) fn upload_envelope(trace_id: &str, filename: &str) -> ImageUpload {
    ImageUpload {
        timestamp: Utc::now(),
        trace_id: trace_id.to_string(),
        group_id: format!("group-{trace_id}"),
        telegram_username: String::new(),
        original_filename: filename.to_string(),
        original_path: format!("{trace_id}/{filename}"),
        telegram_id: 0,
    }
}
