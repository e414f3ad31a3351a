//! Backend-agnostic work queue.
//!
//! A [`Broker`] moves [`TaskRecord`]s for one named queue. Backends differ
//! only in how they remember what is in flight:
//!
//! - [`RedisListBroker`]: move-on-read into a per-consumer holding list
//! - [`RedisStreamBroker`]: consumer-group pending entries, acked by id
//! - [`KafkaBroker`]: partition offsets, committed by hand
//! - [`MemoryBus`]: all three of the above, in process
//!
//! Every backend keeps a delivery redeliverable until [`Broker::acknowledge`]
//! returns. On a log, acknowledging a later offset never commits past an
//! earlier one that is still unresolved.

pub mod kafka;
pub mod memory;
mod offsets;
pub mod redis_list;
pub mod redis_stream;

pub use kafka::KafkaBroker;
pub use memory::{MemoryBroker, MemoryBus, MemorySemantics};
pub use redis_list::RedisListBroker;
pub use redis_stream::RedisStreamBroker;

use crate::config::{BackendKind, BrokerConfig, RetryConfig};
use crate::task::{TaskError, TaskRecord};
use async_trait::async_trait;
use backoff::backoff::{Backoff, Constant};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Broker failures. All of them are transient from the pipeline's view.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("broker is not connected")]
    NotConnected,

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

/// How a broker instance participates in its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes only; never joins a consumer group
    Producer,
    /// Receives and acknowledges as a named group member
    Consumer,
}

/// Opaque reference to one delivery, used to acknowledge it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub(crate) kind: HandleKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandleKind {
    /// Raw payload sitting in a holding list
    ListEntry { raw: String },
    /// Stream entry id pending in a consumer group
    StreamEntry { id: String },
    /// Position in a partitioned log
    LogOffset {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

impl DeliveryHandle {
    pub(crate) fn list_entry(raw: impl Into<String>) -> Self {
        Self {
            kind: HandleKind::ListEntry { raw: raw.into() },
        }
    }

    pub(crate) fn stream_entry(id: impl Into<String>) -> Self {
        Self {
            kind: HandleKind::StreamEntry { id: id.into() },
        }
    }

    pub(crate) fn log_offset(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            kind: HandleKind::LogOffset {
                topic: topic.into(),
                partition,
                offset,
            },
        }
    }

    pub(crate) fn mismatch(&self, backend: &str) -> BrokerError {
        BrokerError::Unsupported(format!("{} cannot acknowledge handle {:?}", backend, self.kind))
    }
}

/// One received message. A payload that fails to decode still carries its
/// handle so it can be acknowledged and dropped.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub record: Result<TaskRecord, TaskError>,
}

#[async_trait]
pub trait Broker: Send {
    /// Backend label for logs and metrics
    fn backend(&self) -> &'static str;

    /// Queue, stream or topic this instance serves
    fn queue(&self) -> &str;

    /// One connection attempt. Calling it on a connected broker is a no-op.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Append a record; resolves only after the broker has accepted it
    async fn publish(&mut self, key: &str, record: &TaskRecord) -> Result<(), BrokerError>;

    /// Wait at most `timeout` for the next delivery
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Mark a delivery done. Until this returns it may be redelivered.
    async fn acknowledge(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError>;

    /// Hand an unacknowledged delivery back for a later attempt
    async fn release(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Fixed-delay connect policy with an attempt cap
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.delay(),
        }
    }
}

/// Connect, retrying a broker that is not reachable yet
pub async fn start_with_retry(
    broker: &mut dyn Broker,
    policy: &RetryPolicy,
) -> Result<(), BrokerError> {
    let mut backoff = Constant::new(policy.delay);
    let mut attempts = 0u32;

    loop {
        match broker.connect().await {
            Ok(()) => {
                info!(
                    backend = broker.backend(),
                    queue = %broker.queue(),
                    attempts = attempts + 1,
                    "Connected to broker"
                );
                return Ok(());
            }
            Err(e) => {
                attempts += 1;
                metrics::counter!("broker.connect_failures", "backend" => broker.backend())
                    .increment(1);

                if attempts >= policy.max_attempts {
                    error!(
                        backend = broker.backend(),
                        queue = %broker.queue(),
                        attempts = attempts,
                        error = %e,
                        "Giving up on broker connection"
                    );
                    return Err(e);
                }

                let delay = backoff.next_backoff().unwrap_or(policy.delay);
                warn!(
                    backend = broker.backend(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Broker not reachable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Build the configured backend for one queue
pub fn build_broker(config: &BrokerConfig, queue: &str, role: Role) -> Box<dyn Broker> {
    match config.backend {
        BackendKind::RedisList => Box::new(RedisListBroker::new(
            &config.redis,
            queue,
            role,
            &config.consumer.name,
        )),
        BackendKind::RedisStream => Box::new(RedisStreamBroker::new(
            &config.redis,
            queue,
            role,
            &config.consumer.group,
            &config.consumer.name,
        )),
        BackendKind::Kafka => Box::new(KafkaBroker::new(
            &config.kafka,
            queue,
            role,
            &config.consumer.group,
        )),
    }
}
