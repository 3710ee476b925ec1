//! Pipeline configuration.

use std::time::Duration;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Validity of presigned upload URLs
    pub upload_url_ttl: Duration,
    /// Messages buffered per live subscription
    pub subscriber_buffer: usize,
    /// Longest a delivery waits on a full subscriber buffer before disconnecting it
    pub subscriber_send_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_url_ttl: Duration::from_secs(3600),
            subscriber_buffer: 32,
            subscriber_send_timeout: Duration::from_millis(250),
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            upload_url_ttl: std::env::var("UPLOAD_URL_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.upload_url_ttl),
            subscriber_buffer: std::env::var("SUBSCRIBER_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.subscriber_buffer),
            subscriber_send_timeout: std::env::var("SUBSCRIBER_SEND_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.subscriber_send_timeout),
        }
    }
}
