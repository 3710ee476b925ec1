//! Durable queues over Redis Streams.
//!
//! This crate provides:
//! - A `MessageBroker` abstraction with publish / fetch / ack primitives
//! - A Redis Streams implementation using consumer groups for manual acknowledgement
//! - `QueueConsumer`, the long-running consume loop that dispatches to a handler
//!   and redelivers anything left unacknowledged

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod streams;

pub use broker::{ConsumerSpec, Delivery, MessageBroker, MessageBrokerExt};
pub use config::QueueConfig;
pub use consumer::{ConsumeOptions, DeliveryHandler, QueueConsumer};
pub use error::{QueueError, QueueResult};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBroker;
pub use streams::RedisBroker;
