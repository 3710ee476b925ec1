//! Broker abstraction shared by the publisher and the status consumer.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::QueueResult;

/// Identifies one consumer inside a consumer group on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub queue: String,
    pub group: String,
    pub consumer: String,
}

impl ConsumerSpec {
    pub fn new(
        queue: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

/// A message handed to a consumer and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id, used for acknowledgement.
    pub id: String,
    /// Raw message body. Empty when the entry carried no payload field.
    pub payload: String,
}

/// Durable, named queues with manual acknowledgement.
///
/// A fetched message stays pending for its consumer until `ack` is called.
/// Pending messages are returned again by `fetch_pending` and `reclaim_idle`.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a message and return its broker id once the broker has accepted it.
    async fn publish(&self, queue: &str, payload: &str) -> QueueResult<String>;

    /// Create the consumer group if it does not exist.
    async fn ensure_group(&self, spec: &ConsumerSpec) -> QueueResult<()>;

    /// Fetch messages never delivered to the group, waiting up to `block` for one to arrive.
    async fn fetch_new(
        &self,
        spec: &ConsumerSpec,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>>;

    /// Fetch this consumer's own unacknowledged messages with ids after `after`.
    async fn fetch_pending(
        &self,
        spec: &ConsumerSpec,
        after: &str,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Take over messages any consumer in the group has left unacknowledged for `min_idle`.
    async fn reclaim_idle(
        &self,
        spec: &ConsumerSpec,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Acknowledge and remove a message.
    async fn ack(&self, spec: &ConsumerSpec, delivery_id: &str) -> QueueResult<()>;

    async fn ping(&self) -> QueueResult<()>;
}

/// Typed publishing on top of any broker.
#[async_trait]
pub trait MessageBrokerExt: MessageBroker {
    async fn publish_json<T>(&self, queue: &str, message: &T) -> QueueResult<String>
    where
        T: Serialize + Sync,
    {
        let payload = serde_json::to_string(message)?;
        self.publish(queue, &payload).await
    }
}

impl<B: MessageBroker + ?Sized> MessageBrokerExt for B {}
