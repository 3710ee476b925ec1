//! Transcode job submission.

use std::sync::Arc;

use tracing::{info, warn};
use vpipe_models::{JobId, TranscodeJobMessage, VideoStatus};
use vpipe_queue::{MessageBroker, MessageBrokerExt};
use vpipe_records::VideoRepository;

use crate::error::{PipelineError, PipelineResult};
use crate::metrics::{record_job_published, record_job_rejected};

/// Publishes transcode jobs to the worker queue.
pub struct JobPublisher {
    broker: Arc<dyn MessageBroker>,
    repository: Arc<dyn VideoRepository>,
    queue: String,
    bucket: String,
}

impl JobPublisher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        repository: Arc<dyn VideoRepository>,
        queue: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            repository,
            queue: queue.into(),
            bucket: bucket.into(),
        }
    }

    /// Queue a transcode for an uploaded source file.
    ///
    /// Returns once the broker has accepted the message. Submitting the same job
    /// twice before it finishes publishes twice; workers tolerate the repeat.
    pub async fn submit_transcode(&self, job_id: &JobId) -> PipelineResult<()> {
        if self
            .repository
            .exists_with_status(job_id, VideoStatus::Public)
            .await?
        {
            record_job_rejected("already_transcoded");
            return Err(PipelineError::AlreadyTranscoded(job_id.clone()));
        }
        if self
            .repository
            .exists_with_status(job_id, VideoStatus::Error)
            .await?
        {
            record_job_rejected("transcode_failed");
            return Err(PipelineError::TranscodeFailed(job_id.clone()));
        }

        let message = TranscodeJobMessage::for_upload(job_id.clone(), self.bucket.as_str());
        let message_id = self
            .broker
            .publish_json(&self.queue, &message)
            .await
            .map_err(|e| {
                warn!(job_id = %job_id, queue = %self.queue, "Failed to publish job: {}", e);
                PipelineError::QueueUnavailable(e)
            })?;

        record_job_published();
        info!(job_id = %job_id, message_id = %message_id, "Published transcode job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::eq;
    use vpipe_models::VideoRecord;
    use vpipe_queue::{ConsumerSpec, Delivery, QueueError, QueueResult};
    use vpipe_records::MemoryVideoRepository;

    mock! {
        Broker {}

        #[async_trait]
        impl MessageBroker for Broker {
            async fn publish(&self, queue: &str, payload: &str) -> QueueResult<String>;
            async fn ensure_group(&self, spec: &ConsumerSpec) -> QueueResult<()>;
            async fn fetch_new(
                &self,
                spec: &ConsumerSpec,
                count: usize,
                block: Duration,
            ) -> QueueResult<Vec<Delivery>>;
            async fn fetch_pending(
                &self,
                spec: &ConsumerSpec,
                after: &str,
                count: usize,
            ) -> QueueResult<Vec<Delivery>>;
            async fn reclaim_idle(
                &self,
                spec: &ConsumerSpec,
                min_idle: Duration,
                count: usize,
            ) -> QueueResult<Vec<Delivery>>;
            async fn ack(&self, spec: &ConsumerSpec, delivery_id: &str) -> QueueResult<()>;
            async fn ping(&self) -> QueueResult<()>;
        }
    }

    async fn repo_with(id: &str, status: VideoStatus) -> Arc<MemoryVideoRepository> {
        let repo = Arc::new(MemoryVideoRepository::new());
        repo.create(&VideoRecord::processing(JobId::from(id), "owner", "title", ""))
            .await
            .unwrap();
        if status != VideoStatus::Processing {
            repo.update_status(&JobId::from(id), status).await.unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_publishes_job_message() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .with(
                eq("video.transcode"),
                eq(r#"{"jobId":"abc123","bucket":"video","path":"abc123/original"}"#),
            )
            .times(1)
            .returning(|_, _| Ok("1-0".to_string()));

        let repo = repo_with("abc123", VideoStatus::Processing).await;
        let publisher = JobPublisher::new(Arc::new(broker), repo, "video.transcode", "video");

        publisher.submit_transcode(&JobId::from("abc123")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_job_is_still_published() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(1)
            .returning(|_, _| Ok("1-0".to_string()));

        let publisher = JobPublisher::new(
            Arc::new(broker),
            Arc::new(MemoryVideoRepository::new()),
            "video.transcode",
            "video",
        );

        assert!(publisher.submit_transcode(&JobId::from("nope")).await.is_ok());
    }

    #[tokio::test]
    async fn test_public_job_is_rejected_without_publishing() {
        let mut broker = MockBroker::new();
        broker.expect_publish().never();

        let repo = repo_with("done", VideoStatus::Public).await;
        let publisher = JobPublisher::new(Arc::new(broker), repo, "video.transcode", "video");

        let err = publisher
            .submit_transcode(&JobId::from("done"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyTranscoded(_)));
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_failed_job_is_rejected_without_publishing() {
        let mut broker = MockBroker::new();
        broker.expect_publish().never();

        let repo = repo_with("broken", VideoStatus::Error).await;
        let publisher = JobPublisher::new(Arc::new(broker), repo, "video.transcode", "video");

        let err = publisher
            .submit_transcode(&JobId::from("broken"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TranscodeFailed(_)));
    }

    #[tokio::test]
    async fn test_broker_failure_is_reported() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .returning(|_, _| Err(QueueError::connection_failed("connection refused")));

        let repo = repo_with("abc123", VideoStatus::Processing).await;
        let publisher = JobPublisher::new(Arc::new(broker), repo, "video.transcode", "video");

        let err = publisher
            .submit_transcode(&JobId::from("abc123"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::QueueUnavailable(_)));
        assert!(!err.is_rejection());
    }
}
