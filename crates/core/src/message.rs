//! Stage-boundary envelopes.
//!
//! One envelope per queue hop, all JSON with RFC3339 timestamps. Consumers
//! ignore unknown fields so envelopes can grow without breaking older
//! readers. `telegram_id == 0` marks a message that did not originate from a
//! user (batch API, watched directory).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured metadata produced by the vision model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Short human title.
    pub title: String,
    /// One- or two-sentence description.
    pub description: String,
    /// Search keywords, most relevant first.
    pub keywords: Vec<String>,
}

impl ImageMetadata {
    /// True when no field carries content.
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.description.is_empty() && self.keywords.is_empty()
    }
}

/// Terminal status of a processed image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Metadata was embedded and the result uploaded.
    Completed,
    /// The pipeline gave up on this image.
    Failed,
}

/// Emitted by ingress once the original bytes are durably in the `original`
/// bucket. Immutable for the rest of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageUpload {
    /// Emit time.
    pub timestamp: DateTime<Utc>,
    /// Correlation id minted at ingress.
    pub trace_id: String,
    /// Scope id for related uploads.
    pub group_id: String,
    /// Originating username, empty for non-user origins.
    #[serde(default)]
    pub telegram_username: String,
    /// Filename as supplied (or synthesized) at ingress.
    pub original_filename: String,
    /// Object key in the `original` bucket.
    pub original_path: String,
    /// Originating user id, 0 for non-user origins.
    #[serde(default)]
    pub telegram_id: i64,
}

/// Emitted by the analyzer once the vision model has produced metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataGenerated {
    /// Emit time.
    pub timestamp: DateTime<Utc>,
    /// Correlation id, copied from the upload.
    pub trace_id: String,
    /// Scope id, copied from the upload.
    pub group_id: String,
    /// Filename, copied from the upload.
    pub original_filename: String,
    /// Object key in the `original` bucket, copied from the upload.
    pub original_path: String,
    /// Generated metadata.
    pub metadata: ImageMetadata,
    /// Originating user id, copied from the upload.
    #[serde(default)]
    pub telegram_id: i64,
}

/// Emitted by the processor when an image reaches a terminal state, success
/// or failure; downstream consumers are notified either way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageProcessed {
    /// Emit time.
    pub timestamp: DateTime<Utc>,
    /// Correlation id, copied from the upload.
    pub trace_id: String,
    /// Scope id, copied from the upload.
    pub group_id: String,
    /// Originating username, empty for non-user origins.
    #[serde(default)]
    pub telegram_username: String,
    /// Filename, copied from the upload.
    pub original_filename: String,
    /// Object key in the `processed` bucket. Empty iff `status` is `failed`.
    pub processed_path: String,
    /// Terminal status.
    pub status: ProcessingStatus,
    /// Failure detail, present iff `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Originating user id, copied from the upload.
    #[serde(default)]
    pub telegram_id: i64,
}

impl MetadataGenerated {
    /// Build the analyzer's output envelope from the consumed upload.
    pub fn from_upload(upload: &ImageUpload, metadata: ImageMetadata) -> Self {
        Self {
            timestamp: Utc::now(),
            trace_id: upload.trace_id.clone(),
            group_id: upload.group_id.clone(),
            original_filename: upload.original_filename.clone(),
            original_path: upload.original_path.clone(),
            metadata,
            telegram_id: upload.telegram_id,
        }
    }
}

impl ImageProcessed {
    /// Success envelope for a generated-metadata message.
    pub fn completed(generated: &MetadataGenerated, processed_path: String) -> Self {
        Self {
            timestamp: Utc::now(),
            trace_id: generated.trace_id.clone(),
            group_id: generated.group_id.clone(),
            telegram_username: String::new(),
            original_filename: generated.original_filename.clone(),
            processed_path,
            status: ProcessingStatus::Completed,
            error: None,
            telegram_id: generated.telegram_id,
        }
    }

    /// Failure envelope for a generated-metadata message. `processed_path`
    /// stays empty: the object was never written.
    pub fn failed(generated: &MetadataGenerated, error: String) -> Self {
        Self {
            timestamp: Utc::now(),
            trace_id: generated.trace_id.clone(),
            group_id: generated.group_id.clone(),
            telegram_username: String::new(),
            original_filename: generated.original_filename.clone(),
            processed_path: String::new(),
            status: ProcessingStatus::Failed,
            error: Some(error),
            telegram_id: generated.telegram_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> ImageUpload {
        ImageUpload {
            timestamp: Utc::now(),
            trace_id: "trace-1".to_string(),
            group_id: "group-1".to_string(),
            telegram_username: "alice".to_string(),
            original_filename: "cat.jpg".to_string(),
            original_path: "trace-1/cat.jpg".to_string(),
            telegram_id: 42,
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProcessingStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&ProcessingStatus::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let expected = upload();
        let mut value = serde_json::to_value(&expected).unwrap();
        value["something_new"] = serde_json::json!({"nested": true});
        let parsed: ImageUpload = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn upload_wire_field_names() {
        let value = serde_json::to_value(upload()).unwrap();
        for key in [
            "timestamp",
            "trace_id",
            "group_id",
            "telegram_username",
            "original_filename",
            "original_path",
            "telegram_id",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
    }

    #[test]
    fn generated_copies_correlation_fields() {
        let up = upload();
        let generated = MetadataGenerated::from_upload(
            &up,
            ImageMetadata {
                title: "t".to_string(),
                description: "d".to_string(),
                keywords: vec!["k".to_string()],
            },
        );
        assert_eq!(generated.trace_id, up.trace_id);
        assert_eq!(generated.group_id, up.group_id);
        assert_eq!(generated.original_path, up.original_path);
        assert_eq!(generated.telegram_id, up.telegram_id);
    }

    #[test]
    fn failed_envelope_has_no_processed_path() {
        let generated = MetadataGenerated::from_upload(&upload(), ImageMetadata::default());
        let processed = ImageProcessed::failed(&generated, "vision unavailable".to_string());
        assert_eq!(processed.status, ProcessingStatus::Failed);
        assert!(processed.processed_path.is_empty());
        assert_eq!(processed.error.as_deref(), Some("vision unavailable"));

        let json = serde_json::to_value(&processed).unwrap();
        assert_eq!(json["status"], "failed");
    }

    #[test]
    fn completed_envelope_omits_error_field() {
        let generated = MetadataGenerated::from_upload(&upload(), ImageMetadata::default());
        let processed =
            ImageProcessed::completed(&generated, "processed/trace-1/cat.jpg".to_string());
        let json = serde_json::to_value(&processed).unwrap();
        assert!(json.get("error").is_none());
    }
}
