//! Video records and the status state machine the pipeline drives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::JobId;

/// Publication status of a video record.
///
/// Only `Processing -> Public` and `Processing -> Error` are permitted, each at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoStatus {
    /// Uploaded or awaiting transcode
    #[default]
    Processing,
    /// Transcoded and visible
    Public,
    /// Transcoding failed
    Error,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Processing => "PROCESSING",
            VideoStatus::Public => "PUBLIC",
            VideoStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VideoStatus::Public | VideoStatus::Error)
    }

    /// Whether a record in this status may move to `next`.
    pub fn can_transition_to(&self, next: VideoStatus) -> bool {
        matches!(
            (self, next),
            (VideoStatus::Processing, VideoStatus::Public)
                | (VideoStatus::Processing, VideoStatus::Error)
        )
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VideoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(VideoStatus::Processing),
            "PUBLIC" => Ok(VideoStatus::Public),
            "ERROR" => Ok(VideoStatus::Error),
            other => Err(format!("unknown video status: {other}")),
        }
    }
}

/// Video record owned by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: JobId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: String,
    pub upload_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: VideoStatus,
}

impl VideoRecord {
    /// New record as created at upload-URL issuance time.
    pub fn processing(
        id: JobId,
        owner_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            description: description.into(),
            owner_id: owner_id.into(),
            upload_timestamp: Utc::now(),
            status: VideoStatus::Processing,
        }
    }

    /// Listing, search and detail endpoints only show public records.
    pub fn is_listable(&self) -> bool {
        self.status == VideoStatus::Public
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [VideoStatus; 3] = [
        VideoStatus::Processing,
        VideoStatus::Public,
        VideoStatus::Error,
    ];

    #[test]
    fn test_only_forward_transitions_from_processing() {
        for from in ALL {
            for to in ALL {
                let expected = from == VideoStatus::Processing && to != VideoStatus::Processing;
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&VideoStatus::Public).unwrap(), "\"PUBLIC\"");
        assert_eq!("ERROR".parse::<VideoStatus>().unwrap(), VideoStatus::Error);
        assert!("public".parse::<VideoStatus>().is_err());
    }

    #[test]
    fn test_new_record_is_processing_and_hidden() {
        let record = VideoRecord::processing(JobId::from("abc"), "user-1", "Title", "");
        assert_eq!(record.status, VideoStatus::Processing);
        assert!(!record.is_listable());
    }
}
