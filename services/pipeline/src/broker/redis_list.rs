//! Reliable list queue on Redis.
//!
//! Producers `LPUSH` onto `queue:{name}`. A consumer `BRPOPLPUSH`es each
//! entry into its own holding list `queue:{name}:processing:{consumer}` and
//! `LREM`s it from there on acknowledge, so anything still in a holding list
//! was received but never finished.

use super::{Broker, BrokerError, Delivery, DeliveryHandle, HandleKind, Role};
use crate::config::RedisConfig;
use crate::task::TaskRecord;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct RedisListBroker {
    url: String,
    name: String,
    queue_key: String,
    processing_key: String,
    role: Role,
    consumer: String,
    conn: Option<MultiplexedConnection>,
}

pub(crate) fn map_redis_error(err: RedisError) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout(err.to_string())
    } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        BrokerError::Connection(err.to_string())
    } else {
        BrokerError::Protocol(err.to_string())
    }
}

pub(crate) async fn open_connection(url: &str) -> Result<MultiplexedConnection, BrokerError> {
    let client = redis::Client::open(url).map_err(|e| BrokerError::Connection(e.to_string()))?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(map_redis_error)?;
    redis::cmd("PING")
        .query_async::<_, String>(&mut conn)
        .await
        .map_err(map_redis_error)?;
    Ok(conn)
}

fn processing_key(name: &str, consumer: &str) -> String {
    format!("queue:{}:processing:{}", name, consumer)
}

/// Move `raw` from a holding list back to the consuming end of the queue in
/// one transaction, so it is never in both lists or neither.
fn release_pipeline(queue: &str, processing: &str, raw: &str) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .rpush(queue, raw)
        .ignore()
        .lrem(processing, 1, raw)
        .ignore();
    pipe
}

impl RedisListBroker {
    pub fn new(config: &RedisConfig, name: &str, role: Role, consumer: &str) -> Self {
        Self {
            url: config.url.clone(),
            name: name.to_string(),
            queue_key: format!("queue:{}", name),
            processing_key: processing_key(name, consumer),
            role,
            consumer: consumer.to_string(),
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut MultiplexedConnection, BrokerError> {
        self.conn.as_mut().ok_or(BrokerError::NotConnected)
    }

    /// Push everything `consumer` is holding back onto the queue. Used on
    /// restart for our own holding list, and by operators for a consumer
    /// that is gone for good.
    pub async fn requeue_abandoned(&mut self, consumer: &str) -> Result<usize, BrokerError> {
        let holding = processing_key(&self.name, consumer);
        let queue = self.queue_key.clone();
        let conn = self.conn()?;

        let mut moved = 0usize;
        loop {
            let entry: Option<String> = conn
                .rpoplpush(&holding, &queue)
                .await
                .map_err(map_redis_error)?;
            if entry.is_none() {
                break;
            }
            moved += 1;
        }

        if moved > 0 {
            info!(queue = %self.queue_key, consumer = consumer, moved, "Requeued abandoned entries");
        }
        Ok(moved)
    }
}

#[async_trait]
impl Broker for RedisListBroker {
    fn backend(&self) -> &'static str {
        "redis_list"
    }

    fn queue(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        if self.conn.is_some() {
            return Ok(());
        }

        self.conn = Some(open_connection(&self.url).await?);

        if self.role == Role::Consumer {
            let consumer = self.consumer.clone();
            if let Err(e) = self.requeue_abandoned(&consumer).await {
                self.conn = None;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn publish(&mut self, _key: &str, record: &TaskRecord) -> Result<(), BrokerError> {
        let queue = self.queue_key.clone();
        let payload = record.to_json();
        let length: i64 = self
            .conn()?
            .lpush(&queue, payload)
            .await
            .map_err(map_redis_error)?;
        debug!(queue = %queue, length, "Pushed entry");
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        if self.role != Role::Consumer {
            return Err(BrokerError::Unsupported(
                "producer-role broker cannot consume".to_string(),
            ));
        }

        // BRPOPLPUSH blocks in whole seconds; 0 would mean forever.
        let block_secs = timeout.as_secs().max(1);
        let queue = self.queue_key.clone();
        let processing = self.processing_key.clone();

        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&queue)
            .arg(&processing)
            .arg(block_secs)
            .query_async(self.conn()?)
            .await
            .map_err(map_redis_error)?;

        Ok(raw.map(|raw| Delivery {
            record: TaskRecord::from_json(raw.as_bytes()),
            handle: DeliveryHandle::list_entry(raw),
        }))
    }

    async fn acknowledge(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        let HandleKind::ListEntry { raw } = &handle.kind else {
            return Err(handle.mismatch(self.backend()));
        };

        let processing = self.processing_key.clone();
        let removed: i64 = self
            .conn()?
            .lrem(&processing, 1, raw)
            .await
            .map_err(map_redis_error)?;

        if removed == 0 {
            warn!(holding = %processing, "Acknowledged entry was no longer held");
        }
        Ok(())
    }

    async fn release(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        let HandleKind::ListEntry { raw } = &handle.kind else {
            return Err(handle.mismatch(self.backend()));
        };

        // RPUSH puts it at the consuming end so it is retried next.
        release_pipeline(&self.queue_key, &self.processing_key, raw)
            .query_async::<_, ()>(self.conn()?)
            .await
            .map_err(map_redis_error)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.conn = None;
        Ok(())
    }
}
