//! Status update messages emitted by the transcoding workers.
//!
//! The same message type is relayed verbatim to browser progress channels, so the
//! wire names here are the client contract as well.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::{JobId, VideoStatus};

/// Stage reported by a worker for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscodeStatus {
    /// Renditions are being encoded
    Transcoding,
    /// Renditions are being written back to storage
    Uploading,
    /// All renditions are available
    Completed,
    /// The worker gave up on the job
    Error,
}

impl TranscodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeStatus::Transcoding => "TRANSCODING",
            TranscodeStatus::Uploading => "UPLOADING",
            TranscodeStatus::Completed => "COMPLETED",
            TranscodeStatus::Error => "ERROR",
        }
    }

    /// No further messages are expected for the job after a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TranscodeStatus::Completed | TranscodeStatus::Error)
    }

    /// Record status a terminal message finalizes the video to.
    pub fn terminal_record_status(&self) -> Option<VideoStatus> {
        match self {
            TranscodeStatus::Completed => Some(VideoStatus::Public),
            TranscodeStatus::Error => Some(VideoStatus::Error),
            TranscodeStatus::Transcoding | TranscodeStatus::Uploading => None,
        }
    }
}

impl fmt::Display for TranscodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected status message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing job id")]
    EmptyJobId,

    #[error("progress for {label} out of range: {value}")]
    ProgressOutOfRange { label: String, value: f64 },
}

/// Progress or outcome of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateMessage {
    #[serde(rename = "jobId", alias = "videoId")]
    pub job_id: JobId,

    pub status: TranscodeStatus,

    /// Percent complete per rendition label, e.g. `"720p"`.
    #[serde(rename = "progressByResolution", alias = "progress", default)]
    pub progress_by_resolution: Option<BTreeMap<String, f64>>,

    #[serde(rename = "errorDetail", alias = "error", default)]
    pub error_detail: Option<String>,
}

impl StatusUpdateMessage {
    pub fn progress(
        job_id: JobId,
        status: TranscodeStatus,
        progress_by_resolution: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            job_id,
            status,
            progress_by_resolution: Some(progress_by_resolution),
            error_detail: None,
        }
    }

    pub fn completed(job_id: JobId) -> Self {
        Self {
            job_id,
            status: TranscodeStatus::Completed,
            progress_by_resolution: None,
            error_detail: None,
        }
    }

    pub fn failed(job_id: JobId, detail: impl Into<String>) -> Self {
        Self {
            job_id,
            status: TranscodeStatus::Error,
            progress_by_resolution: None,
            error_detail: Some(detail.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Parse and validate a queue payload.
    pub fn from_json(payload: &str) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_str(payload)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        if self.job_id.is_empty() {
            return Err(MessageError::EmptyJobId);
        }
        if let Some(progress) = &self.progress_by_resolution {
            for (label, value) in progress {
                if !value.is_finite() || !(0.0..=100.0).contains(value) {
                    return Err(MessageError::ProgressOutOfRange {
                        label: label.clone(),
                        value: *value,
                    });
                }
            }
        }
        Ok(())
    }
}
