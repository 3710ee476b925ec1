//! S3-compatible object storage.
//!
//! Only upload capability is exposed: a time-limited presigned PUT for a single key.
//! The client transfers bytes straight to storage; nothing here reads or lists objects.

pub mod client;
pub mod error;

pub use client::{PresignedUpload, S3Config, S3Storage, UploadUrlSigner, VIDEO_CONTENT_TYPE};
pub use error::{StorageError, StorageResult};
