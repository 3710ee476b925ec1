//! Redis Streams broker.
//!
//! Each queue is a stream. Consumers read through a consumer group, so a message
//! stays in the group's pending list until it is acknowledged; acknowledged entries
//! are deleted from the stream.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, info, warn};

use crate::broker::{ConsumerSpec, Delivery, MessageBroker};
use crate::error::{QueueError, QueueResult};

/// Stream field holding the JSON body.
const PAYLOAD_FIELD: &str = "payload";

/// Broker backed by Redis Streams.
///
/// Owns two managed connections opened in [`RedisBroker::connect`]: one for ordinary
/// commands and one reserved for blocking reads, so a consumer waiting on
/// `XREADGROUP BLOCK` never delays a publish. Each reconnects on its own after the
/// server drops it; the command that saw the failure still returns an error. Both
/// are closed when the broker is dropped.
pub struct RedisBroker {
    commands: ConnectionManager,
    reader: ConnectionManager,
}

impl RedisBroker {
    /// Open the broker connections.
    pub async fn connect(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::connection_failed(format!("invalid Redis URL: {e}")))?;
        let commands = ConnectionManager::new_with_config(client.clone(), manager_config()).await?;
        let reader = ConnectionManager::new_with_config(client, manager_config()).await?;
        info!("Connected to Redis broker");
        Ok(Self { commands, reader })
    }

    /// Close the broker connections.
    pub fn close(self) {
        info!("Closing Redis broker connections");
    }

    fn into_deliveries(entries: Vec<StreamId>) -> Vec<Delivery> {
        entries
            .into_iter()
            .map(|entry| {
                let payload = entry.get::<String>(PAYLOAD_FIELD).unwrap_or_else(|| {
                    warn!(message_id = %entry.id, "Stream entry has no payload field");
                    String::new()
                });
                Delivery {
                    id: entry.id,
                    payload,
                }
            })
            .collect()
    }
}

/// Reconnect backoff for the managed connections. No response timeout is set, so a
/// blocking read is never cut short.
fn manager_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig::new()
        .set_number_of_retries(5)
        .set_max_delay(5_000)
        .set_connection_timeout(Duration::from_secs(5))
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish(&self, queue: &str, payload: &str) -> QueueResult<String> {
        let mut conn = self.commands.clone();

        let message_id: String = redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        debug!(queue = %queue, message_id = %message_id, "Published message");
        Ok(message_id)
    }

    async fn ensure_group(&self, spec: &ConsumerSpec) -> QueueResult<()> {
        let mut conn = self.commands.clone();

        // Start at 0 so messages written before the group existed are still consumed.
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&spec.queue)
            .arg(&spec.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group {} on {}", spec.group, spec.queue),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", spec.group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn fetch_new(
        &self,
        spec: &ConsumerSpec,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.reader.clone();

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&spec.group)
            .arg(&spec.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&spec.queue)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        Ok(Self::into_deliveries(entries))
    }

    async fn fetch_pending(
        &self,
        spec: &ConsumerSpec,
        after: &str,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.commands.clone();

        // An explicit id reads this consumer's pending list instead of new entries.
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&spec.group)
            .arg(&spec.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&spec.queue)
            .arg(after)
            .query_async(&mut conn)
            .await?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        Ok(Self::into_deliveries(entries))
    }

    async fn reclaim_idle(
        &self,
        spec: &ConsumerSpec,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.commands.clone();
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&spec.queue)
            .arg(&spec.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&spec.queue)
            .arg(&spec.group)
            .arg(&spec.consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        if !claimed.ids.is_empty() {
            info!(
                queue = %spec.queue,
                count = claimed.ids.len(),
                "Reclaimed idle pending messages"
            );
        }
        Ok(Self::into_deliveries(claimed.ids))
    }

    async fn ack(&self, spec: &ConsumerSpec, delivery_id: &str) -> QueueResult<()> {
        let mut conn = self.commands.clone();

        redis::cmd("XACK")
            .arg(&spec.queue)
            .arg(&spec.group)
            .arg(delivery_id)
            .query_async::<()>(&mut conn)
            .await?;

        // Delete the message from the stream
        redis::cmd("XDEL")
            .arg(&spec.queue)
            .arg(delivery_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!(queue = %spec.queue, message_id = %delivery_id, "Acknowledged message");
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.commands.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
