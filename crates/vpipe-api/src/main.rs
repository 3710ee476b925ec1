//! Axum API server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vpipe_api::{create_router, metrics, ApiConfig, AppState, RecordsBackend};
use vpipe_pipeline::PipelineConfig;
use vpipe_queue::{MessageBroker, QueueConfig, QueueConsumer, RedisBroker};
use vpipe_records::{
    FirestoreClient, FirestoreVideoRepository, MemoryVideoRepository, VideoRepository,
};
use vpipe_storage::S3Storage;

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    if let Err(e) = run().await {
        error!("vpipe-api failed: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vpipe=info,tower_http=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn run() -> anyhow::Result<()> {
    // Required by rustls 0.23+ for the Redis and Firestore TLS clients
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting vpipe-api");

    let config = ApiConfig::from_env();
    let pipeline = PipelineConfig::from_env();
    let queue = QueueConfig::from_env();
    info!(
        host = %config.host,
        port = config.port,
        records = ?config.records_backend,
        "API config loaded"
    );
    config.validate()?;

    let broker = Arc::new(
        RedisBroker::connect(&queue.redis_url)
            .await
            .context("connecting to Redis")?,
    );
    let storage = Arc::new(S3Storage::from_env().context("configuring object storage")?);
    let repository: Arc<dyn VideoRepository> = match config.records_backend {
        RecordsBackend::Firestore => {
            let client = FirestoreClient::from_env()
                .await
                .context("configuring Firestore")?;
            Arc::new(FirestoreVideoRepository::new(client))
        }
        RecordsBackend::Memory => {
            warn!("Using in-memory video records; data is lost on restart");
            Arc::new(MemoryVideoRepository::new())
        }
    };

    let metrics_enabled = std::env::var("METRICS_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);
    let metrics_handle = if metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics().context("installing metrics recorder")?)
    } else {
        None
    };

    let state = AppState::new(
        config.clone(),
        &pipeline,
        &queue.transcode_queue,
        broker.clone(),
        storage,
        repository,
    );

    // Status consumer runs for the life of the process, independent of requests.
    let consumer = QueueConsumer::new(
        broker.clone() as Arc<dyn MessageBroker>,
        queue.status_consumer(),
        queue.consume_options(),
    );
    let consumer_task = Arc::clone(&state.relay).spawn(consumer, state.shutdown_receiver());

    let shutdown_state = state.clone();
    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Progress streams never end on their own for a job that stays in PROCESSING.
        shutdown_state.begin_shutdown();
    })
    .await
    .context("serving HTTP")?;

    // The consumer finishes its in-flight status message, then the broker is released.
    if let Err(e) = consumer_task.await {
        error!("Status consumer task panicked: {}", e);
    }
    match Arc::try_unwrap(broker) {
        Ok(broker) => broker.close(),
        Err(_) => warn!("Broker still referenced at shutdown"),
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal");
}
