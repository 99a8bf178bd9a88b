#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Pipeline engine: the queue runtime, object-store access, and the
//! analyzer/processor workers that move an image from upload to tagged
//! output.

pub mod analyzer;
pub mod health;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod worker;

#[cfg(test)]
mod testsupport;

pub use analyzer::Analyzer;
pub use health::{ComponentHealth, HealthChecker, HealthReport, HealthState};
pub use processor::Processor;
pub use queue::{
    Consumer, DlqInspector, FetchedMessage, Publisher, QueueConfig, QueueError,
};
pub use storage::{ObjectStorage, ObjectStore, StorageConfig, StorageError, content_type_for};
pub use worker::{
    MessageHandler, MessagePublisher, ModelSource, PoolHealth, WorkerConfig, WorkerPool,
};
