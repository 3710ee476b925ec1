//! Application state.

use std::sync::Arc;

use tokio::sync::watch;
use vpipe_pipeline::{
    JobPublisher, PipelineConfig, ProgressRelay, SubscriptionRegistry, UploadCoordinator,
};
use vpipe_queue::MessageBroker;
use vpipe_records::VideoRepository;
use vpipe_storage::UploadUrlSigner;

use crate::auth::JwtVerifier;
use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub coordinator: Arc<UploadCoordinator>,
    pub publisher: Arc<JobPublisher>,
    pub relay: Arc<ProgressRelay>,
    pub broker: Arc<dyn MessageBroker>,
    pub storage: Arc<dyn UploadUrlSigner>,
    pub repository: Arc<dyn VideoRepository>,
    pub jwt: Arc<JwtVerifier>,
    /// Flips to `true` once when the server starts shutting down.
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    /// Wire the pipeline components around already-opened backends.
    pub fn new(
        config: ApiConfig,
        pipeline: &PipelineConfig,
        transcode_queue: &str,
        broker: Arc<dyn MessageBroker>,
        storage: Arc<dyn UploadUrlSigner>,
        repository: Arc<dyn VideoRepository>,
    ) -> Self {
        let coordinator = UploadCoordinator::new(
            Arc::clone(&storage),
            Arc::clone(&repository),
            pipeline.upload_url_ttl,
        );
        let publisher = JobPublisher::new(
            Arc::clone(&broker),
            Arc::clone(&repository),
            transcode_queue,
            storage.bucket(),
        );
        let registry =
            SubscriptionRegistry::new(pipeline.subscriber_buffer, pipeline.subscriber_send_timeout);
        let relay = ProgressRelay::new(registry, Arc::clone(&repository));
        let jwt = JwtVerifier::new(&config.jwt_secret);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            coordinator: Arc::new(coordinator),
            publisher: Arc::new(publisher),
            relay: Arc::new(relay),
            broker,
            storage,
            repository,
            jwt: Arc::new(jwt),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Tell the status consumer and every open progress stream to finish.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
