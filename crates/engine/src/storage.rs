//! Object-store access (MinIO through the S3 API).
//!
//! Two buckets: `original` holds ingress bytes, `processed` holds the tagged
//! output. Keys are caller-chosen and echoed through the envelopes, so the
//! store never needs a listing.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

/// Store failures, flattened to what the retry policy needs.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The operation did not finish inside the configured timeout.
    #[error("storage {op} {bucket}/{key} timed out after {timeout:?}")]
    Timeout {
        /// Operation name.
        op: &'static str,
        /// Bucket.
        bucket: String,
        /// Object key.
        key: String,
        /// Configured limit.
        timeout: Duration,
    },
    /// The store rejected or failed the operation.
    #[error("storage {op} {bucket}/{key}: {message}")]
    Operation {
        /// Operation name.
        op: &'static str,
        /// Bucket.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying error rendering.
        message: String,
    },
}

/// Connection settings for the object store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Host and port, no scheme (`localhost:9000`).
    pub endpoint: String,
    /// Access key.
    pub access_key: String,
    /// Secret key.
    pub secret_key: String,
    /// Use https to reach the endpoint.
    pub use_ssl: bool,
    /// Region label; MinIO accepts anything consistent.
    pub region: String,
    /// Bucket for ingress bytes.
    pub original_bucket: String,
    /// Bucket for tagged output.
    pub processed_bucket: String,
    /// Per-operation timeout.
    pub operation_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            use_ssl: false,
            region: "us-east-1".to_string(),
            original_bucket: "original".to_string(),
            processed_bucket: "processed".to_string(),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// What the workers need from an object store.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch a whole object into memory.
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Write a whole object.
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Name of the ingress bucket.
    fn original_bucket(&self) -> &str;

    /// Name of the output bucket.
    fn processed_bucket(&self) -> &str;
}

/// S3/MinIO implementation of [`ObjectStorage`].
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    config: StorageConfig,
}

impl ObjectStore {
    /// Build a client for the configured endpoint. Path-style addressing,
    /// as MinIO expects.
    pub fn connect(config: StorageConfig) -> Self {
        let scheme = if config.use_ssl { "https" } else { "http" };
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "photoflow",
        );
        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(format!("{scheme}://{}", config.endpoint))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            config,
        }
    }

    /// Create both buckets when they do not exist yet.
    pub async fn ensure_buckets(&self) -> Result<(), StorageError> {
        for bucket in [
            self.config.original_bucket.clone(),
            self.config.processed_bucket.clone(),
        ] {
            let exists = self
                .client
                .head_bucket()
                .bucket(&bucket)
                .send()
                .await
                .is_ok();
            if exists {
                continue;
            }
            self.client
                .create_bucket()
                .bucket(&bucket)
                .send()
                .await
                .map_err(|err| StorageError::Operation {
                    op: "create_bucket",
                    bucket: bucket.clone(),
                    key: String::new(),
                    message: err.to_string(),
                })?;
            info!(bucket, "created bucket");
        }
        Ok(())
    }

    /// Cheap reachability probe for health checks.
    pub async fn probe(&self) -> Result<(), StorageError> {
        tokio::time::timeout(
            self.config.operation_timeout,
            self.client
                .head_bucket()
                .bucket(&self.config.original_bucket)
                .send(),
        )
        .await
        .map_err(|_| StorageError::Timeout {
            op: "head_bucket",
            bucket: self.config.original_bucket.clone(),
            key: String::new(),
            timeout: self.config.operation_timeout,
        })?
        .map_err(|err| StorageError::Operation {
            op: "head_bucket",
            bucket: self.config.original_bucket.clone(),
            key: String::new(),
            message: err.to_string(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for ObjectStore {
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let timeout = self.config.operation_timeout;
        let response = tokio::time::timeout(
            timeout,
            self.client.get_object().bucket(bucket).key(key).send(),
        )
        .await
        .map_err(|_| StorageError::Timeout {
            op: "download",
            bucket: bucket.to_string(),
            key: key.to_string(),
            timeout,
        })?
        .map_err(|err| StorageError::Operation {
            op: "download",
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: err.to_string(),
        })?;

        let body = tokio::time::timeout(timeout, response.body.collect())
            .await
            .map_err(|_| StorageError::Timeout {
                op: "download",
                bucket: bucket.to_string(),
                key: key.to_string(),
                timeout,
            })?
            .map_err(|err| StorageError::Operation {
                op: "download",
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: err.to_string(),
            })?;

        let bytes = body.into_bytes().to_vec();
        debug!(bucket, key, size = bytes.len(), "downloaded object");
        Ok(bytes)
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let timeout = self.config.operation_timeout;
        let size = bytes.len();
        tokio::time::timeout(
            timeout,
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type(content_type)
                .body(ByteStream::from(bytes))
                .send(),
        )
        .await
        .map_err(|_| StorageError::Timeout {
            op: "upload",
            bucket: bucket.to_string(),
            key: key.to_string(),
            timeout,
        })?
        .map_err(|err| StorageError::Operation {
            op: "upload",
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: err.to_string(),
        })?;

        debug!(bucket, key, size, content_type, "uploaded object");
        Ok(())
    }

    fn original_bucket(&self) -> &str {
        &self.config.original_bucket
    }

    fn processed_bucket(&self) -> &str {
        &self.config.processed_bucket
    }
}

/// Content type by filename extension. Only PNG is special-cased; the
/// pipeline treats everything else as JPEG.
pub fn content_type_for(filename: &str) -> &'static str {
    if filename.to_lowercase().ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    }
}
