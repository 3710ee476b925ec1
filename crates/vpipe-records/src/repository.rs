//! Repository interface used by the pipeline.

use async_trait::async_trait;
use vpipe_models::{JobId, VideoRecord, VideoStatus};

use crate::error::RecordResult;

/// Outcome of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The record moved to the requested status.
    Applied,
    /// The record already had the requested status; nothing was written.
    Unchanged,
}

/// Storage of video records.
///
/// `update_status` is conditional: it writes only a permitted transition and is a
/// no-op when the record already holds the target status, so repeating it is safe.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, record: &VideoRecord) -> RecordResult<()>;

    async fn get(&self, id: &JobId) -> RecordResult<Option<VideoRecord>>;

    /// Move a record to `status`. Fails with `NotFound` or `InvalidTransition`.
    async fn update_status(&self, id: &JobId, status: VideoStatus) -> RecordResult<StatusChange>;

    async fn exists_with_status(&self, id: &JobId, status: VideoStatus) -> RecordResult<bool>;

    /// Cheap round-trip used by readiness checks.
    async fn probe(&self) -> RecordResult<()> {
        Ok(())
    }
}
