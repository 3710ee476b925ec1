//! In-process broker with the same acknowledgement semantics as the Redis one.
//!
//! Consumer groups are collapsed into one group per queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::broker::{ConsumerSpec, Delivery, MessageBroker};
use crate::error::{QueueError, QueueResult};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    pending: BTreeMap<String, PendingEntry>,
    published: Vec<String>,
}

struct PendingEntry {
    payload: String,
    consumer: String,
    since: Instant,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    next_seq: u64,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the broker were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Every payload ever published to `queue`, in order.
    pub fn published(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.published.clone())
            .unwrap_or_default()
    }

    /// Messages fetched but not yet acknowledged.
    pub fn pending_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.pending.len())
    }

    /// Messages not yet fetched by any consumer.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(state: &State) -> QueueResult<()> {
        if state.unavailable {
            return Err(QueueError::connection_failed("broker unavailable"));
        }
        Ok(())
    }

    fn take_ready(&self, spec: &ConsumerSpec, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let queue = state.queues.entry(spec.queue.clone()).or_default();
        let mut batch = Vec::new();
        while batch.len() < count {
            let Some(delivery) = queue.ready.pop_front() else {
                break;
            };
            queue.pending.insert(
                delivery.id.clone(),
                PendingEntry {
                    payload: delivery.payload.clone(),
                    consumer: spec.consumer.clone(),
                    since: Instant::now(),
                },
            );
            batch.push(delivery);
        }
        Ok(batch)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: &str) -> QueueResult<String> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state.next_seq += 1;
        let id = format!("{:016}-0", state.next_seq);
        let queue = state.queues.entry(queue.to_string()).or_default();
        queue.published.push(payload.to_string());
        queue.ready.push_back(Delivery {
            id: id.clone(),
            payload: payload.to_string(),
        });
        Ok(id)
    }

    async fn ensure_group(&self, _spec: &ConsumerSpec) -> QueueResult<()> {
        Self::check_available(&self.lock())
    }

    async fn fetch_new(
        &self,
        spec: &ConsumerSpec,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let batch = self.take_ready(spec, count)?;
        if batch.is_empty() && !block.is_zero() {
            tokio::time::sleep(block).await;
            return self.take_ready(spec, count);
        }
        Ok(batch)
    }

    async fn fetch_pending(
        &self,
        spec: &ConsumerSpec,
        after: &str,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let state = self.lock();
        Self::check_available(&state)?;
        let Some(queue) = state.queues.get(&spec.queue) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .pending
            .iter()
            .filter(|(id, entry)| id.as_str() > after && entry.consumer == spec.consumer)
            .take(count)
            .map(|(id, entry)| Delivery {
                id: id.clone(),
                payload: entry.payload.clone(),
            })
            .collect())
    }

    async fn reclaim_idle(
        &self,
        spec: &ConsumerSpec,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        let Some(queue) = state.queues.get_mut(&spec.queue) else {
            return Ok(Vec::new());
        };
        let mut batch = Vec::new();
        for (id, entry) in queue.pending.iter_mut() {
            if batch.len() == count {
                break;
            }
            if entry.since.elapsed() >= min_idle {
                entry.consumer = spec.consumer.clone();
                entry.since = Instant::now();
                batch.push(Delivery {
                    id: id.clone(),
                    payload: entry.payload.clone(),
                });
            }
        }
        Ok(batch)
    }

    async fn ack(&self, spec: &ConsumerSpec, delivery_id: &str) -> QueueResult<()> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        if let Some(queue) = state.queues.get_mut(&spec.queue) {
            queue.pending.remove(delivery_id);
        }
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        Self::check_available(&self.lock())
    }
}
