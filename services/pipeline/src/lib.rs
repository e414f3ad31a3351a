//! Frame Pipeline - reliable work queue for the video detection stages
//!
//! Stages never call each other. They exchange tasks through a [`broker`]
//! with at-least-once delivery:
//!
//! - uploads become [`VideoTask`]s
//! - frame extraction turns each into [`FrameTask`]s
//! - detection turns each frame into a [`DetectionResult`]
//!
//! A stage wraps its logic in a [`TaskHandler`] and drives it with a
//! [`TaskConsumer`], which acknowledges only after the handler succeeded or
//! hit an error that redelivery cannot fix.
//!
//! # Example
//!
//! ```rust,no_run
//! use frame_pipeline::broker::{build_broker, Role};
//! use frame_pipeline::config::BrokerConfig;
//! use frame_pipeline::{TaskProducer, VideoTask};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BrokerConfig::default();
//!     let broker = build_broker(&config, &config.topics.video_tasks, Role::Producer);
//!     let mut producer: TaskProducer<VideoTask> = TaskProducer::new(broker);
//!     producer.start(&config.retry.clone().into()).await?;
//!     producer.publish(&VideoTask::new("video-1", "videos/video-1.mp4")).await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod integrity;
pub mod producer;
pub mod s3;
pub mod shutdown;
pub mod sink;
pub mod storage;
pub mod task;
pub mod telemetry;

pub use broker::{Broker, BrokerError, DeliveryHandle, MemoryBus, MemorySemantics, RetryPolicy, Role};
pub use config::{BrokerConfig, ConfigError, ServiceConfig, StorageConfig, WorkerConfig};
pub use consumer::{LoopStats, Received, TaskConsumer, TaskHandler};
pub use error::{Disposition, DropReason, PipelineError};
pub use producer::TaskProducer;
pub use shutdown::Shutdown;
pub use sink::{MemoryResultSink, PgResultSink, ResultSink, SinkError};
pub use storage::{FileSystemStore, FrameStore, MemoryStore, StorageError};
pub use task::{Detection, DetectionResult, FrameTask, TaskError, TaskRecord, VideoTask, WireTask};

/// Re-exported for handler implementations
pub use async_trait::async_trait;
