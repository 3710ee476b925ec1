//! Pipeline error types.

use thiserror::Error;
use vpipe_models::JobId;
use vpipe_queue::QueueError;
use vpipe_records::RecordError;
use vpipe_storage::StorageError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] StorageError),

    #[error("Repository error: {0}")]
    Repository(#[from] RecordError),

    #[error("Job {0} is already transcoded")]
    AlreadyTranscoded(JobId),

    #[error("Job {0} failed transcoding and must be uploaded again")]
    TranscodeFailed(JobId),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(#[source] QueueError),
}

impl PipelineError {
    /// Expected rejections, as opposed to infrastructure faults.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::AlreadyTranscoded(_) | Self::TranscodeFailed(_))
    }
}
