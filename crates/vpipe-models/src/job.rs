//! Job identifiers and the transcode work message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an upload.
///
/// The same value names the video record, prefixes the object storage key
/// and correlates queue messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh unguessable id: 128 random bits as 32 lowercase hex chars.
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Object storage key the client uploads the source bytes to.
pub fn original_object_key(job_id: &JobId) -> String {
    format!("{}/original", job_id)
}

/// Work item handed to the external transcoding workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeJobMessage {
    #[serde(rename = "jobId", alias = "videoId")]
    pub job_id: JobId,
    pub bucket: String,
    pub path: String,
}

impl TranscodeJobMessage {
    /// Message pointing the worker at the job's original upload.
    pub fn for_upload(job_id: JobId, bucket: impl Into<String>) -> Self {
        let path = original_object_key(&job_id);
        Self {
            job_id,
            bucket: bucket.into(),
            path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_128_bit_hex() {
        let id = JobId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generate_is_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| JobId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_original_object_key() {
        assert_eq!(original_object_key(&JobId::from("abc123")), "abc123/original");
    }

    #[test]
    fn test_transcode_message_wire_format() {
        let msg = TranscodeJobMessage::for_upload(JobId::from("abc123"), "video");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "jobId": "abc123", "bucket": "video", "path": "abc123/original" })
        );
    }

    #[test]
    fn test_transcode_message_accepts_legacy_video_id() {
        let msg: TranscodeJobMessage =
            serde_json::from_str(r#"{"videoId":"v1","bucket":"video","path":"v1/original"}"#)
                .unwrap();
        assert_eq!(msg.job_id.as_str(), "v1");
    }
}
