//! Status consumption and progress fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vpipe_models::{JobId, StatusUpdateMessage, TranscodeStatus, VideoStatus};
use vpipe_queue::{Delivery, DeliveryHandler, QueueConsumer};
use vpipe_records::{RecordError, StatusChange, VideoRepository};

use crate::error::PipelineResult;
use crate::metrics::{record_fast_path, record_malformed_message, record_status_message};
use crate::registry::{DeliveryReport, Subscription, SubscriptionRegistry};

/// Detail sent to subscribers who arrive after a job already failed.
pub const FAILED_DETAIL: &str = "transcoding failed";

/// Relays worker status messages to live subscribers and finalizes records.
pub struct ProgressRelay {
    registry: SubscriptionRegistry,
    repository: Arc<dyn VideoRepository>,
}

impl ProgressRelay {
    pub fn new(registry: SubscriptionRegistry, repository: Arc<dyn VideoRepository>) -> Self {
        Self {
            registry,
            repository,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Subscribe to a job's progress.
    ///
    /// If the job already finished, the subscription receives one synthesized
    /// terminal message and then ends. The subscriber is registered before the
    /// record is read, so a terminal message racing with the read is seen at
    /// most once.
    pub async fn subscribe(&self, job_id: JobId) -> Subscription {
        let subscription = self.registry.subscribe(job_id.clone());

        match self.repository.get(&job_id).await {
            Ok(Some(record)) => {
                let synthesized = match record.status {
                    VideoStatus::Public => Some(StatusUpdateMessage::completed(job_id.clone())),
                    VideoStatus::Error => {
                        Some(StatusUpdateMessage::failed(job_id.clone(), FAILED_DETAIL))
                    }
                    VideoStatus::Processing => None,
                };
                if let Some(message) = synthesized {
                    let status = message.status;
                    if self.registry.complete_if_registered(&subscription, message) {
                        record_fast_path(status);
                        debug!(job_id = %job_id, status = %status, "Job already finished");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(job_id = %job_id, "Status lookup failed, waiting for live updates: {}", e);
            }
        }

        subscription
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.registry.unsubscribe(subscription);
    }

    /// Apply one status message.
    ///
    /// A terminal message moves the record to its final status before subscribers
    /// hear about it. If that write fails the error is returned and the message
    /// should be redelivered; subscribers have not been notified yet.
    pub async fn process(&self, message: &StatusUpdateMessage) -> PipelineResult<DeliveryReport> {
        if let Some(target) = message.status.terminal_record_status() {
            self.finalize(&message.job_id, target).await?;
        }

        let report = self.registry.deliver(message).await;
        record_status_message(message.status);

        if report.delivered == 0 && report.evicted == 0 {
            debug!(job_id = %message.job_id, status = %message.status, "No subscribers for job");
        } else {
            debug!(
                job_id = %message.job_id,
                status = %message.status,
                delivered = report.delivered,
                evicted = report.evicted,
                "Relayed status"
            );
        }

        Ok(report)
    }

    async fn finalize(&self, job_id: &JobId, target: VideoStatus) -> PipelineResult<()> {
        match self.repository.update_status(job_id, target).await {
            Ok(StatusChange::Applied) => {
                info!(job_id = %job_id, status = %target, "Finalized video record");
                Ok(())
            }
            Ok(StatusChange::Unchanged) => Ok(()),
            Err(RecordError::NotFound(_)) => {
                warn!(job_id = %job_id, "Status message for unknown job");
                Ok(())
            }
            Err(e @ RecordError::InvalidTransition { .. }) => {
                warn!(job_id = %job_id, "Ignoring conflicting terminal status: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run the status consumer on a background task until `shutdown` flips.
    pub fn spawn(
        self: Arc<Self>,
        consumer: QueueConsumer,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { consumer.run(self.as_ref(), shutdown).await })
    }
}

#[async_trait]
impl DeliveryHandler for ProgressRelay {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let message = match StatusUpdateMessage::from_json(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                // Redelivery cannot fix a bad payload.
                warn!(message_id = %delivery.id, "Discarding malformed status message: {}", e);
                record_malformed_message();
                return Ok(());
            }
        };

        if message.status == TranscodeStatus::Error {
            warn!(
                job_id = %message.job_id,
                detail = message.error_detail.as_deref().unwrap_or(""),
                "Transcode failed"
            );
        }

        self.process(&message).await?;
        Ok(())
    }
}
