//! Frame detection service.
//!
//! ```text
//! frame-tasks -> verify digest -> inference pool -> detections table
//! ```
//!
//! Configuration comes from `config/detection`,
//! `/etc/frame-pipeline/detection` and `DETECTION__*` variables, e.g.
//! `DETECTION__INFERENCE__ENDPOINT=http://yolo:8000/detect`.

use anyhow::{Context, Result};
use frame_detection::{DetectionConfig, DetectionHandler, HttpDetector, InferencePool};
use frame_pipeline::broker::{build_broker, RetryPolicy, Role};
use frame_pipeline::storage::build_store;
use frame_pipeline::telemetry::{init_metrics, init_tracing};
use frame_pipeline::{FrameTask, PgResultSink, Shutdown, TaskConsumer};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DetectionConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.service)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        backend = config.broker.backend.as_str(),
        "Starting frame detection service"
    );

    config.validate()?;
    init_metrics(config.service.metrics_port)?;

    let result = run(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Frame detection service failed");
    }
    result
}

async fn run(config: DetectionConfig) -> Result<()> {
    let policy: RetryPolicy = config.broker.retry.clone().into();

    let store = build_store(&config.storage)
        .await
        .context("Failed to initialize storage")?;
    let sink = PgResultSink::connect(&config.database)
        .await
        .context("Failed to connect to result database")?;

    let detector = HttpDetector::new(&config.inference);
    info!(endpoint = %detector.endpoint(), workers = config.inference.pool_size, "Using inference service");
    let pool = Arc::new(InferencePool::new(
        Arc::new(detector),
        config.inference.pool_size,
        config.inference.queue_capacity,
    )?);

    let mut consumer: TaskConsumer<FrameTask> = TaskConsumer::new(
        build_broker(&config.broker, &config.broker.topics.frame_tasks, Role::Consumer),
        config.broker.consumer.poll_timeout(),
    )
    .with_error_backoff(config.worker.error_backoff());
    consumer
        .start(&policy)
        .await
        .context("Failed to connect frame task consumer")?;

    let handler = DetectionHandler::new(store, Arc::clone(&pool), Arc::new(sink));

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    info!(
        group = %config.broker.consumer.group,
        consumer = %config.broker.consumer.name,
        "Worker ready. Waiting for frames"
    );
    consumer.run(&handler, &shutdown).await;

    // The last task's ack decision is made; nothing is waiting on the pool
    if let Err(e) = consumer.stop().await {
        error!(error = %e, "Failed to stop consumer cleanly");
    }
    pool.shutdown().await;

    info!("Frame detection service stopped");
    Ok(())
}
