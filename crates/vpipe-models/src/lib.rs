//! Shared data models for the vpipe ingestion pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Job identifiers and transcode work messages
//! - Video records and their status state machine
//! - Status update messages emitted by the transcoding workers

pub mod job;
pub mod status;
pub mod video;

// Re-export common types
pub use job::{original_object_key, JobId, TranscodeJobMessage};
pub use status::{MessageError, StatusUpdateMessage, TranscodeStatus};
pub use video::{VideoRecord, VideoStatus};
