//! Long-running consume loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{ConsumerSpec, Delivery, MessageBroker};
use crate::error::QueueResult;

/// Processes one delivery. Returning `Ok` acknowledges it; an error leaves it
/// pending so it is delivered again.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Tuning for [`QueueConsumer`].
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub batch_size: usize,
    /// Upper bound on a single blocking fetch, and so on shutdown latency.
    pub block: Duration,
    pub reclaim_interval: Duration,
    pub reclaim_min_idle: Duration,
    /// Pause after a broker error before fetching again.
    pub error_backoff: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            block: Duration::from_millis(2000),
            reclaim_interval: Duration::from_secs(15),
            reclaim_min_idle: Duration::from_secs(30),
            error_backoff: Duration::from_secs(2),
        }
    }
}

/// Consumes one queue through a consumer group and dispatches each message to a handler
/// in broker order.
pub struct QueueConsumer {
    broker: Arc<dyn MessageBroker>,
    spec: ConsumerSpec,
    options: ConsumeOptions,
}

impl QueueConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        spec: ConsumerSpec,
        options: ConsumeOptions,
    ) -> Self {
        Self {
            broker,
            spec,
            options,
        }
    }

    /// Run until the shutdown flag becomes `true`.
    ///
    /// Messages this consumer fetched before a crash are dispatched first. Broker
    /// errors, including those during startup, are retried after `error_backoff`.
    /// The in-flight batch always finishes before the loop exits.
    pub async fn run<H>(&self, handler: &H, mut shutdown: watch::Receiver<bool>)
    where
        H: DeliveryHandler + ?Sized,
    {
        info!(
            queue = %self.spec.queue,
            group = %self.spec.group,
            consumer = %self.spec.consumer,
            "Starting queue consumer"
        );

        loop {
            if *shutdown.borrow() {
                info!(queue = %self.spec.queue, "Queue consumer stopped before startup");
                return;
            }
            match self.start(handler).await {
                Ok(()) => break,
                Err(e) => {
                    error!(queue = %self.spec.queue, "Queue consumer startup failed: {}", e);
                    self.backoff(&mut shutdown).await;
                }
            }
        }

        let mut last_reclaim = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_reclaim.elapsed() >= self.options.reclaim_interval {
                self.reclaim(handler).await;
                last_reclaim = Instant::now();
            }

            match self
                .broker
                .fetch_new(&self.spec, self.options.batch_size, self.options.block)
                .await
            {
                Ok(batch) => {
                    if !batch.is_empty() {
                        debug!(count = batch.len(), "Fetched messages");
                    }
                    for delivery in &batch {
                        self.dispatch(handler, delivery).await;
                    }
                }
                Err(e) => {
                    error!(queue = %self.spec.queue, "Error fetching messages: {}", e);
                    self.backoff(&mut shutdown).await;
                }
            }
        }

        info!(queue = %self.spec.queue, "Queue consumer stopped");
    }

    /// Create the group and drain this consumer's own pending list.
    async fn start<H>(&self, handler: &H) -> QueueResult<()>
    where
        H: DeliveryHandler + ?Sized,
    {
        self.broker.ensure_group(&self.spec).await?;
        self.redeliver_own_pending(handler).await
    }

    async fn backoff(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.options.error_backoff) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Dispatch one delivery and acknowledge it on success.
    pub async fn dispatch<H>(&self, handler: &H, delivery: &Delivery) -> bool
    where
        H: DeliveryHandler + ?Sized,
    {
        match handler.handle(delivery).await {
            Ok(()) => {
                if let Err(e) = self.broker.ack(&self.spec, &delivery.id).await {
                    // Stays pending and is reclaimed later; handlers tolerate repeats.
                    warn!(message_id = %delivery.id, "Failed to ack message: {}", e);
                    return false;
                }
                true
            }
            Err(e) => {
                warn!(
                    message_id = %delivery.id,
                    "Dispatch failed, leaving message pending: {:#}",
                    e
                );
                false
            }
        }
    }

    async fn redeliver_own_pending<H>(&self, handler: &H) -> QueueResult<()>
    where
        H: DeliveryHandler + ?Sized,
    {
        let mut cursor = "0".to_string();
        let mut redelivered = 0usize;

        loop {
            let batch = self
                .broker
                .fetch_pending(&self.spec, &cursor, self.options.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.id.clone();
            redelivered += batch.len();
            for delivery in &batch {
                self.dispatch(handler, delivery).await;
            }
        }

        if redelivered > 0 {
            info!(count = redelivered, "Redelivered pending messages from previous run");
        }
        Ok(())
    }

    async fn reclaim<H>(&self, handler: &H)
    where
        H: DeliveryHandler + ?Sized,
    {
        match self
            .broker
            .reclaim_idle(
                &self.spec,
                self.options.reclaim_min_idle,
                self.options.batch_size,
            )
            .await
        {
            Ok(batch) => {
                for delivery in &batch {
                    self.dispatch(handler, delivery).await;
                }
            }
            Err(e) => warn!("Failed to reclaim pending messages: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use std::sync::Mutex;

    /// Records payloads; fails the first attempt for payloads starting with "flaky".
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
            let mut seen = self.seen.lock().unwrap();
            let first_attempt = !seen.contains(&delivery.payload);
            seen.push(delivery.payload.clone());
            if delivery.payload.starts_with("flaky") && first_attempt {
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    fn fast_options() -> ConsumeOptions {
        ConsumeOptions {
            batch_size: 4,
            block: Duration::from_millis(5),
            reclaim_interval: Duration::from_millis(10),
            reclaim_min_idle: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
        }
    }

    async fn run_until<F>(broker: Arc<MemoryBroker>, recorder: Arc<Recorder>, done: F)
    where
        F: Fn(&Recorder) -> bool,
    {
        let (tx, rx) = watch::channel(false);
        let consumer = QueueConsumer::new(
            broker,
            ConsumerSpec::new("status", "relay", "relay-1"),
            fast_options(),
        );
        let handler = Arc::clone(&recorder);
        let task = tokio::spawn(async move { consumer.run(handler.as_ref(), rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !done(recorder.as_ref()) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("consumer did not make progress");

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatches_in_order_and_acks() {
        let broker = Arc::new(MemoryBroker::new());
        for payload in ["a", "b", "c"] {
            broker.publish("status", payload).await.unwrap();
        }
        let recorder = Arc::new(Recorder::default());

        run_until(broker.clone(), recorder.clone(), |r| r.seen().len() == 3).await;

        assert_eq!(recorder.seen(), vec!["a", "b", "c"]);
        assert_eq!(broker.pending_len("status"), 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_redelivered() {
        let broker = Arc::new(MemoryBroker::new());
        broker.publish("status", "flaky-1").await.unwrap();
        let recorder = Arc::new(Recorder::default());

        run_until(broker.clone(), recorder.clone(), |r| r.seen().len() == 2).await;

        assert_eq!(recorder.seen(), vec!["flaky-1", "flaky-1"]);
        assert_eq!(broker.pending_len("status"), 0);
    }

    #[tokio::test]
    async fn test_pending_from_previous_run_dispatched_first() {
        let broker = Arc::new(MemoryBroker::new());
        let spec = ConsumerSpec::new("status", "relay", "relay-1");
        broker.publish("status", "left-over").await.unwrap();
        // Simulate a crash after fetch and before ack.
        let fetched = broker.fetch_new(&spec, 1, Duration::ZERO).await.unwrap();
        assert_eq!(fetched.len(), 1);
        broker.publish("status", "fresh").await.unwrap();

        let recorder = Arc::new(Recorder::default());
        run_until(broker.clone(), recorder.clone(), |r| r.seen().len() == 2).await;

        assert_eq!(recorder.seen(), vec!["left-over", "fresh"]);
        assert_eq!(broker.pending_len("status"), 0);
    }

    #[tokio::test]
    async fn test_startup_retries_until_broker_recovers() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_unavailable(true);
        let recorder = Arc::new(Recorder::default());

        let (tx, rx) = watch::channel(false);
        let consumer = QueueConsumer::new(
            broker.clone(),
            ConsumerSpec::new("status", "relay", "relay-1"),
            fast_options(),
        );
        let handler = Arc::clone(&recorder);
        let task = tokio::spawn(async move { consumer.run(handler.as_ref(), rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        broker.set_unavailable(false);
        broker.publish("status", "after-recovery").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.seen().is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("consumer never started after broker recovered");

        tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(recorder.seen(), vec!["after-recovery"]);
        assert_eq!(broker.pending_len("status"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_startup_retries() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_unavailable(true);
        let (tx, rx) = watch::channel(false);
        let consumer = QueueConsumer::new(
            broker,
            ConsumerSpec::new("status", "relay", "relay-1"),
            fast_options(),
        );
        let recorder = Recorder::default();

        let run = consumer.run(&recorder, rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("consumer ignored shutdown while retrying startup");
    }
}
