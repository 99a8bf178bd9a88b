#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Thin wrapper around the `exiftool` binary for writing EXIF/IPTC/XMP
//! metadata into an image file in place, plus read-back verification and an
//! availability probe for health checks.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use photoflow_core::ImageMetadata;
use tokio::process::Command;

/// Default invocation timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrapper failures.
#[derive(Debug, thiserror::Error)]
pub enum ExifToolError {
    /// The binary could not be started.
    #[error("spawn {binary}: {source}")]
    Spawn {
        /// Configured binary path.
        binary: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The invocation exceeded the configured timeout.
    #[error("exiftool timed out after {0:?}")]
    Timeout(Duration),
    /// The tool exited non-zero.
    #[error("exiftool exited with status {exit}: {output}")]
    Embed {
        /// Process exit code (-1 when killed by signal).
        exit: i32,
        /// Combined stdout and stderr.
        output: String,
    },
    /// Read-back output was not the expected JSON.
    #[error("parse exiftool output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Handle to a configured exiftool binary.
#[derive(Debug, Clone)]
pub struct ExifTool {
    binary: String,
    timeout: Duration,
}

impl ExifTool {
    /// New handle; `binary` is a path or a name resolved via `PATH`.
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Write `metadata` into the file at `path` in place.
    pub async fn write_metadata(
        &self,
        path: &Path,
        metadata: &ImageMetadata,
    ) -> Result<(), ExifToolError> {
        let mut args = write_args(metadata);
        args.push(path.to_string_lossy().into_owned());
        self.run(&args).await?;
        Ok(())
    }

    /// Read the written tags back and report whether any field came through.
    ///
    /// This mirrors the permissive check the pipeline has always shipped:
    /// verified means at least one of Title/Description/Keywords/Subject is
    /// non-empty and the output does not contain the substring `"error"`.
    pub async fn verify_metadata(&self, path: &Path) -> Result<bool, ExifToolError> {
        let args = [
            "-j",
            "-Title",
            "-Description",
            "-Keywords",
            "-Subject",
            &path.to_string_lossy(),
        ];
        let output = self
            .run(&args.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .await?;

        if output.to_lowercase().contains("error") {
            return Ok(false);
        }

        let parsed: serde_json::Value = serde_json::from_str(output.trim())?;
        let entry = match parsed.as_array().and_then(|a| a.first()) {
            Some(entry) => entry,
            None => return Ok(false),
        };

        let present = ["Title", "Description", "Keywords", "Subject"]
            .iter()
            .any(|tag| match entry.get(*tag) {
                Some(serde_json::Value::String(s)) => !s.is_empty(),
                Some(serde_json::Value::Array(a)) => !a.is_empty(),
                Some(serde_json::Value::Null) | None => false,
                Some(_) => true,
            });
        Ok(present)
    }

    /// Availability probe; returns the reported version string.
    pub async fn version(&self) -> Result<String, ExifToolError> {
        let output = self.run(&["-ver".to_string()]).await?;
        Ok(output.trim().to_string())
    }

    async fn run(&self, args: &[String]) -> Result<String, ExifToolError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, async {
            cmd.output().await.map_err(|source| ExifToolError::Spawn {
                binary: self.binary.clone(),
                source,
            })
        })
        .await
        .map_err(|_| ExifToolError::Timeout(self.timeout))??;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ExifToolError::Embed {
                exit: output.status.code().unwrap_or(-1),
                output: combined,
            });
        }
        Ok(combined)
    }
}

/// Argument list for a metadata write, without the trailing image path.
///
/// The order is fixed: flags, title tags, description tags, then one
/// IPTC/XMP pair per keyword.
pub fn write_args(metadata: &ImageMetadata) -> Vec<String> {
    let mut args = vec![
        "-overwrite_original".to_string(),
        "-charset".to_string(),
        "utf8".to_string(),
    ];

    if !metadata.title.is_empty() {
        args.push(format!("-XPTitle={}", metadata.title));
        args.push(format!("-IPTC:Headline={}", metadata.title));
        args.push(format!("-XMP:Title={}", metadata.title));
    }
    if !metadata.description.is_empty() {
        args.push(format!("-ImageDescription={}", metadata.description));
        args.push(format!("-IPTC:Caption-Abstract={}", metadata.description));
        args.push(format!("-XMP:Description={}", metadata.description));
    }
    for keyword in &metadata.keywords {
        if keyword.is_empty() {
            continue;
        }
        args.push(format!("-IPTC:Keywords+={keyword}"));
        args.push(format!("-XMP:Subject+={keyword}"));
    }

    args
}
