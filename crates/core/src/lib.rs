#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared wire types for the photoflow pipeline (stage envelopes, metadata,
//! correlation ids).

pub mod ids;
pub mod message;

pub use message::{
    ImageMetadata, ImageProcessed, ImageUpload, MetadataGenerated, ProcessingStatus,
};
