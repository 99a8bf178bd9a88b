#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Batch coordination: accept a set of image sources over HTTP, fan them
//! into the pipeline, correlate terminal envelopes back to per-image state,
//! and push live progress to subscribers. Also hosts the DLQ admin and
//! health surfaces.

pub mod coordinator;
pub mod dlq;
pub mod http;
pub mod job;
pub mod progress;

pub use coordinator::{BatchCoordinator, BatchLimits, BatchRequest, BatchSource};
pub use dlq::{DlqAdmin, FailedJob};
pub use http::{AppState, router};
pub use job::{BatchImageStatus, BatchJob, ImageState, JobStatus, JobStore};
pub use progress::{ProgressBroadcaster, ProgressEvent, ProgressEventKind};
