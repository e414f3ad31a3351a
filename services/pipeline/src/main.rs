//! Operator tool for the frame pipeline.
//!
//! - `enqueue <video_path> [video_id]` stores a local video and publishes a
//!   `VideoTask` for it, the way the upload service does
//! - `check` verifies that the configured broker is reachable

use anyhow::{bail, Context, Result};
use frame_pipeline::broker::{build_broker, start_with_retry, RetryPolicy, Role};
use frame_pipeline::config::{load_layered, BrokerConfig, ServiceConfig, StorageConfig};
use frame_pipeline::producer::TaskProducer;
use frame_pipeline::storage::build_store;
use frame_pipeline::task::VideoTask;
use frame_pipeline::telemetry::init_tracing;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ToolConfig {
    #[serde(default)]
    service: ServiceConfig,
    #[serde(default)]
    broker: BrokerConfig,
    #[serde(default)]
    storage: StorageConfig,
}

async fn run_enqueue(config: ToolConfig, video_path: &str, video_id: Option<String>) -> Result<()> {
    let video_id = video_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let bytes = tokio::fs::read(Path::new(video_path))
        .await
        .with_context(|| format!("Failed to read {}", video_path))?;

    let store = build_store(&config.storage)
        .await
        .context("Failed to initialize storage")?;
    let reference = store
        .save_video(&video_id, &bytes)
        .await
        .context("Failed to store video")?;

    let broker = build_broker(&config.broker, &config.broker.topics.video_tasks, Role::Producer);
    let mut producer: TaskProducer<VideoTask> = TaskProducer::new(broker);
    producer
        .start(&config.broker.retry.clone().into())
        .await
        .context("Failed to connect to broker")?;

    let task = VideoTask::new(&video_id, &reference);
    producer.publish(&task).await.context("Failed to publish video task")?;
    producer.stop().await?;

    info!(video_id = %video_id, video_path = %reference, size_bytes = bytes.len(), "Video enqueued");
    println!("{}", video_id);
    Ok(())
}

async fn run_check(config: ToolConfig) -> Result<()> {
    let policy: RetryPolicy = config.broker.retry.clone().into();
    let mut failed = false;

    for queue in [&config.broker.topics.video_tasks, &config.broker.topics.frame_tasks] {
        let mut broker = build_broker(&config.broker, queue, Role::Producer);
        match start_with_retry(broker.as_mut(), &policy).await {
            Ok(()) => {
                println!("{} {}: reachable", broker.backend(), queue);
                broker.close().await?;
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Broker check failed");
                println!("{} {}: {}", broker.backend(), queue, e);
                failed = true;
            }
        }
    }

    if failed {
        bail!("broker check failed");
    }
    Ok(())
}

fn print_usage() {
    println!("Usage: pipeline <enqueue|check>");
    println!();
    println!("Modes:");
    println!("  enqueue <video_path> [video_id] - Store a video and publish a video task");
    println!("  check                           - Verify the configured broker is reachable");
    println!();
    println!("Environment variables (prefix PIPELINE__):");
    println!("  PIPELINE__BROKER__BACKEND        - redis_list, redis_stream or kafka (default: kafka)");
    println!("  PIPELINE__BROKER__REDIS__URL     - Redis URL (default: redis://localhost:6379)");
    println!("  PIPELINE__BROKER__KAFKA__BOOTSTRAP_SERVERS - Kafka brokers (default: localhost:9092)");
    println!("  PIPELINE__STORAGE__BACKEND       - filesystem or s3 (default: filesystem)");
    println!("  PIPELINE__STORAGE__BASE_PATH     - Filesystem root (default: /data)");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config: ToolConfig = load_layered("pipeline", "PIPELINE").context("Failed to load configuration")?;
    init_tracing(&config.service)?;
    config.broker.validate()?;
    config.storage.validate()?;

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("");

    match mode {
        "enqueue" => {
            let Some(video_path) = args.get(2) else {
                print_usage();
                bail!("enqueue needs a video path");
            };
            run_enqueue(config, video_path, args.get(3).cloned()).await?
        }
        "check" => run_check(config).await?,
        _ => print_usage(),
    }

    Ok(())
}
