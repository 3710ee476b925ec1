//! Queue configuration.

use std::time::Duration;

use crate::broker::ConsumerSpec;
use crate::consumer::ConsumeOptions;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Work queue read by the transcoding workers
    pub transcode_queue: String,
    /// Status queue written by the transcoding workers
    pub status_queue: String,
    /// Consumer group the status relay reads with
    pub status_group: String,
    /// This instance's consumer name; keep it stable across restarts so
    /// unacknowledged messages are picked up again on startup
    pub consumer_name: String,
    /// Longest a status fetch blocks waiting for new messages
    pub block: Duration,
    /// Max messages per fetch
    pub batch_size: usize,
    /// How often idle pending messages are reclaimed
    pub reclaim_interval: Duration,
    /// How long a message must sit unacknowledged before it is reclaimed
    pub reclaim_min_idle: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            transcode_queue: "video.transcode".to_string(),
            status_queue: "video.status".to_string(),
            status_group: "vpipe:relay".to_string(),
            consumer_name: default_consumer_name(),
            block: Duration::from_millis(2000),
            batch_size: 16,
            reclaim_interval: Duration::from_secs(15),
            reclaim_min_idle: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            transcode_queue: std::env::var("TRANSCODE_QUEUE").unwrap_or(defaults.transcode_queue),
            status_queue: std::env::var("STATUS_QUEUE").unwrap_or(defaults.status_queue),
            status_group: std::env::var("STATUS_CONSUMER_GROUP")
                .unwrap_or(defaults.status_group),
            consumer_name: std::env::var("STATUS_CONSUMER_NAME")
                .unwrap_or(defaults.consumer_name),
            // BLOCK 0 waits forever and would stop the consumer seeing shutdown.
            block: Duration::from_millis(
                std::env::var("QUEUE_BLOCK_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(2000)
                    .max(1),
            ),
            batch_size: std::env::var("QUEUE_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            reclaim_interval: defaults.reclaim_interval,
            reclaim_min_idle: Duration::from_secs(
                std::env::var("QUEUE_RECLAIM_IDLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Consumer identity for the status relay.
    pub fn status_consumer(&self) -> ConsumerSpec {
        ConsumerSpec::new(&self.status_queue, &self.status_group, &self.consumer_name)
    }

    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            batch_size: self.batch_size,
            block: self.block,
            reclaim_interval: self.reclaim_interval,
            reclaim_min_idle: self.reclaim_min_idle,
            ..ConsumeOptions::default()
        }
    }
}

fn default_consumer_name() -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.is_empty() => format!("relay-{host}"),
        _ => format!("relay-{}", uuid::Uuid::new_v4()),
    }
}
