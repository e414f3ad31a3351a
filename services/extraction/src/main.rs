//! Frame extraction service.
//!
//! ```text
//! video-uploads -> decode -> sample -> JPEG -> storage + frame-tasks
//! ```
//!
//! Configuration comes from `config/extraction`,
//! `/etc/frame-pipeline/extraction` and `EXTRACTION__*` variables, e.g.
//! `EXTRACTION__BROKER__BACKEND=redis_list`.

use anyhow::{Context, Result};
use frame_extraction::{ExtractionConfig, ExtractionHandler, GstVideoDecoder};
use frame_pipeline::broker::{build_broker, RetryPolicy, Role};
use frame_pipeline::storage::build_store;
use frame_pipeline::telemetry::{init_metrics, init_tracing};
use frame_pipeline::{FrameTask, Shutdown, TaskConsumer, TaskProducer, VideoTask};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ExtractionConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.service)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        backend = config.broker.backend.as_str(),
        "Starting frame extraction service"
    );

    config.validate()?;
    init_metrics(config.service.metrics_port)?;

    let result = run(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Frame extraction service failed");
    }
    result
}

async fn run(config: ExtractionConfig) -> Result<()> {
    let policy: RetryPolicy = config.broker.retry.clone().into();

    let store = build_store(&config.storage)
        .await
        .context("Failed to initialize storage")?;
    let decoder = Arc::new(GstVideoDecoder::new()?);

    let mut producer: TaskProducer<FrameTask> = TaskProducer::new(build_broker(
        &config.broker,
        &config.broker.topics.frame_tasks,
        Role::Producer,
    ));
    producer
        .start(&policy)
        .await
        .context("Failed to connect frame task producer")?;

    let mut consumer: TaskConsumer<VideoTask> = TaskConsumer::new(
        build_broker(&config.broker, &config.broker.topics.video_tasks, Role::Consumer),
        config.broker.consumer.poll_timeout(),
    )
    .with_error_backoff(config.worker.error_backoff());
    consumer
        .start(&policy)
        .await
        .context("Failed to connect video task consumer")?;

    let handler = ExtractionHandler::new(store, decoder, producer, config.extraction.clone());

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    info!(
        group = %config.broker.consumer.group,
        consumer = %config.broker.consumer.name,
        "Worker ready to receive videos"
    );
    consumer.run(&handler, &shutdown).await;

    if let Err(e) = consumer.stop().await {
        error!(error = %e, "Failed to stop consumer cleanly");
    }
    if let Err(e) = handler.stop().await {
        error!(error = %e, "Failed to stop producer cleanly");
    }

    info!("Frame extraction service stopped");
    Ok(())
}
