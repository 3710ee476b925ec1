//! In-process publish/subscribe registry keyed by job id.
//!
//! Each subscription owns a bounded channel. Registration, delivery and retirement
//! for a job happen under that job's lock only, so unrelated jobs never contend.
//! The outer map lock is held just long enough to find or insert a job's slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use vpipe_models::{JobId, StatusUpdateMessage};

use crate::metrics::{record_evicted, subscriptions_closed, subscriptions_opened};

pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<StatusUpdateMessage>,
}

#[derive(Default)]
struct JobSlot {
    subscribers: Vec<Subscriber>,
    /// Set once the slot has been dropped from the map; late arrivals must look again.
    retired: bool,
}

type SharedSlot = Arc<Mutex<JobSlot>>;

struct RegistryInner {
    jobs: Mutex<HashMap<JobId, SharedSlot>>,
    next_id: AtomicU64,
    buffer: usize,
    send_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RegistryInner {
    fn slot(&self, job_id: &JobId) -> Option<SharedSlot> {
        lock(&self.jobs).get(job_id).cloned()
    }

    /// Drop the slot from the map. Caller holds the slot lock.
    fn retire(&self, job_id: &JobId, slot: &SharedSlot, guard: &mut JobSlot) {
        guard.retired = true;
        let mut jobs = lock(&self.jobs);
        if jobs.get(job_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            jobs.remove(job_id);
        }
    }

    fn remove(&self, job_id: &JobId, id: SubscriptionId) -> bool {
        let Some(slot) = self.slot(job_id) else {
            return false;
        };
        let mut guard = lock(&slot);
        let before = guard.subscribers.len();
        guard.subscribers.retain(|s| s.id != id);
        let removed = before - guard.subscribers.len();
        if guard.subscribers.is_empty() && !guard.retired {
            self.retire(job_id, &slot, &mut guard);
        }
        subscriptions_closed(removed);
        removed > 0
    }
}

/// Outcome of delivering one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Subscribers disconnected because their buffer stayed full.
    pub evicted: usize,
    /// Subscriptions closed because the message was terminal.
    pub retired: usize,
}

/// Live subscriptions for all jobs.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(buffer: usize, send_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                jobs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                send_timeout,
            }),
        }
    }

    /// Register a new subscriber for `job_id`.
    pub fn subscribe(&self, job_id: JobId) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber { id, sender };

        loop {
            let slot = Arc::clone(lock(&self.inner.jobs).entry(job_id.clone()).or_default());
            let mut guard = lock(&slot);
            if guard.retired {
                continue;
            }
            guard.subscribers.push(subscriber);
            break;
        }

        subscriptions_opened(1);
        debug!(job_id = %job_id, subscription = id, "Subscribed");

        Subscription {
            id,
            job_id,
            receiver,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Stop delivery to a subscription. Dropping the handle has the same effect.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Deliver a message to every subscriber of its job, in registration order.
    ///
    /// Never waits longer than the configured send timeout, however many subscribers
    /// are slow. A terminal message closes every subscription for the job once sent.
    pub async fn deliver(&self, message: &StatusUpdateMessage) -> DeliveryReport {
        let job_id = &message.job_id;
        let mut report = DeliveryReport::default();
        let Some(slot) = self.inner.slot(job_id) else {
            return report;
        };

        let mut stalled = Vec::new();
        {
            let mut guard = lock(&slot);
            let before = guard.subscribers.len();
            guard.subscribers.retain(|subscriber| {
                match subscriber.sender.try_send(message.clone()) {
                    Ok(()) => {
                        report.delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        stalled.push((subscriber.id, subscriber.sender.clone()));
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            });
            let mut closed = before - guard.subscribers.len();

            if message.is_terminal() {
                report.retired = guard.subscribers.len();
                closed += guard.subscribers.len();
                guard.subscribers.clear();
                self.inner.retire(job_id, &slot, &mut guard);
            } else if guard.subscribers.is_empty() {
                self.inner.retire(job_id, &slot, &mut guard);
            }
            subscriptions_closed(closed);
        }

        if stalled.is_empty() {
            return report;
        }

        let timeout = self.inner.send_timeout;
        let results = join_all(stalled.iter().map(|(_, sender)| {
            tokio::time::timeout(timeout, sender.send(message.clone()))
        }))
        .await;

        for ((id, _), result) in stalled.iter().zip(results) {
            if matches!(result, Ok(Ok(()))) {
                report.delivered += 1;
                continue;
            }
            warn!(job_id = %job_id, subscription = id, "Subscriber buffer full, disconnecting");
            report.evicted += 1;
            if !message.is_terminal() {
                self.inner.remove(job_id, *id);
            }
        }
        record_evicted(report.evicted);

        report
    }

    /// Deliver `message` to this one subscription and close it, but only if it is
    /// still registered. Returns false when a terminal message already reached it.
    ///
    /// The owner is usually not reading yet, so a full buffer is finished on a
    /// background task that waits up to the send timeout.
    pub fn complete_if_registered(
        &self,
        subscription: &Subscription,
        message: StatusUpdateMessage,
    ) -> bool {
        let job_id = subscription.job_id();
        let Some(slot) = self.inner.slot(job_id) else {
            return false;
        };
        let mut guard = lock(&slot);
        let Some(index) = guard
            .subscribers
            .iter()
            .position(|s| s.id == subscription.id())
        else {
            return false;
        };

        let subscriber = guard.subscribers.remove(index);
        if guard.subscribers.is_empty() {
            self.inner.retire(job_id, &slot, &mut guard);
        }
        drop(guard);
        subscriptions_closed(1);

        match subscriber.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                let timeout = self.inner.send_timeout;
                let job_id = job_id.clone();
                tokio::spawn(async move {
                    let sent = tokio::time::timeout(timeout, subscriber.sender.send(message))
                        .await
                        .is_ok_and(|result| result.is_ok());
                    if !sent {
                        warn!(
                            job_id = %job_id,
                            subscription = subscriber.id,
                            "Subscriber buffer full, final status dropped"
                        );
                        record_evicted(1);
                    }
                });
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Number of live subscriptions for a job.
    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.inner
            .slot(job_id)
            .map_or(0, |slot| lock(&slot).subscribers.len())
    }

    /// Number of jobs with at least one live subscription.
    pub fn watched_jobs(&self) -> usize {
        lock(&self.inner.jobs).len()
    }
}

/// Receiving end of one subscription.
///
/// The stream ends after a terminal message, or when the subscriber was disconnected.
pub struct Subscription {
    id: SubscriptionId,
    job_id: JobId,
    receiver: mpsc::Receiver<StatusUpdateMessage>,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<StatusUpdateMessage> {
        self.receiver.recv().await
    }

    /// Next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<StatusUpdateMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if inner.remove(&self.job_id, self.id) {
                debug!(job_id = %self.job_id, subscription = self.id, "Unsubscribed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vpipe_models::TranscodeStatus;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(8, Duration::from_millis(20))
    }

    fn progress(job: &str, pct: f64) -> StatusUpdateMessage {
        StatusUpdateMessage::progress(
            JobId::from(job),
            TranscodeStatus::Transcoding,
            BTreeMap::from([("720p".to_string(), pct)]),
        )
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_message_in_order() {
        let registry = registry();
        let mut subs: Vec<_> = (0..5).map(|_| registry.subscribe(JobId::from("j"))).collect();

        for pct in [10.0, 20.0, 30.0] {
            let report = registry.deliver(&progress("j", pct)).await;
            assert_eq!(report.delivered, 5);
        }
        let report = registry.deliver(&StatusUpdateMessage::completed(JobId::from("j"))).await;
        assert_eq!(report.retired, 5);

        for sub in &mut subs {
            let mut seen = Vec::new();
            while let Some(msg) = sub.recv().await {
                seen.push(msg);
            }
            assert_eq!(seen.len(), 4);
            assert_eq!(seen[0], progress("j", 10.0));
            assert_eq!(seen[2], progress("j", 30.0));
            assert_eq!(seen[3].status, TranscodeStatus::Completed);
        }
        assert_eq!(registry.watched_jobs(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_isolates_other_subscribers() {
        let registry = registry();
        let leaving = registry.subscribe(JobId::from("j"));
        let mut staying = registry.subscribe(JobId::from("j"));
        let mut other_job = registry.subscribe(JobId::from("k"));

        registry.unsubscribe(leaving);
        assert_eq!(registry.subscriber_count(&JobId::from("j")), 1);

        assert_eq!(registry.deliver(&progress("j", 50.0)).await.delivered, 1);
        assert_eq!(staying.try_recv(), Some(progress("j", 50.0)));
        assert!(other_job.try_recv().is_none());
        assert_eq!(registry.deliver(&progress("k", 5.0)).await.delivered, 1);
    }

    #[tokio::test]
    async fn test_dropping_last_subscription_removes_job() {
        let registry = registry();
        let sub = registry.subscribe(JobId::from("j"));
        assert_eq!(registry.watched_jobs(), 1);
        drop(sub);
        assert_eq!(registry.watched_jobs(), 0);
        assert_eq!(registry.deliver(&progress("j", 1.0)).await, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_disconnected_without_blocking_others() {
        let registry = SubscriptionRegistry::new(1, Duration::from_millis(10));
        let mut stalled = registry.subscribe(JobId::from("j"));
        let mut healthy = registry.subscribe(JobId::from("j"));

        registry.deliver(&progress("j", 1.0)).await;
        assert_eq!(healthy.try_recv(), Some(progress("j", 1.0)));

        let report = registry.deliver(&progress("j", 2.0)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(healthy.try_recv(), Some(progress("j", 2.0)));

        // The stalled subscriber drains what it had, then its stream ends.
        assert_eq!(stalled.recv().await, Some(progress("j", 1.0)));
        assert_eq!(stalled.recv().await, None);
        assert_eq!(registry.subscriber_count(&JobId::from("j")), 1);
    }

    #[tokio::test]
    async fn test_complete_if_registered_only_once() {
        let registry = registry();
        let mut sub = registry.subscribe(JobId::from("j"));

        let done = StatusUpdateMessage::completed(JobId::from("j"));
        assert!(registry.complete_if_registered(&sub, done.clone()));
        assert!(!registry.complete_if_registered(&sub, done));
        assert_eq!(sub.recv().await.map(|m| m.status), Some(TranscodeStatus::Completed));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_complete_if_registered_waits_for_full_buffer() {
        let registry = SubscriptionRegistry::new(1, Duration::from_millis(500));
        let mut sub = registry.subscribe(JobId::from("j"));
        registry.deliver(&progress("j", 40.0)).await;

        let done = StatusUpdateMessage::completed(JobId::from("j"));
        assert!(registry.complete_if_registered(&sub, done));
        assert_eq!(registry.subscriber_count(&JobId::from("j")), 0);

        assert_eq!(sub.recv().await, Some(progress("j", 40.0)));
        assert_eq!(sub.recv().await.map(|m| m.status), Some(TranscodeStatus::Completed));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_starts_fresh() {
        let registry = registry();
        let _first = registry.subscribe(JobId::from("j"));
        registry.deliver(&StatusUpdateMessage::completed(JobId::from("j"))).await;

        let mut late = registry.subscribe(JobId::from("j"));
        assert_eq!(registry.subscriber_count(&JobId::from("j")), 1);
        registry.deliver(&progress("j", 99.0)).await;
        assert_eq!(late.try_recv(), Some(progress("j", 99.0)));
    }
}
