//! Redis stream with a consumer group.
//!
//! Delivery order for a consumer:
//! 1. after (re)connect, its own pending entries (`XREADGROUP ... 0`)
//! 2. entries of any member idle longer than `claim_idle` (`XPENDING` + `XCLAIM`)
//! 3. new entries (`XREADGROUP ... >` with a bounded `BLOCK`)
//!
//! Fields of a task record are stored as stream entry fields.

use super::redis_list::{map_redis_error, open_connection};
use super::{Broker, BrokerError, Delivery, DeliveryHandle, HandleKind, Role};
use crate::config::RedisConfig;
use crate::task::{TaskError, TaskRecord};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingId, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use tracing::{debug, info};

/// How many pending entries are inspected per claim attempt
const CLAIM_SCAN: usize = 10;

pub struct RedisStreamBroker {
    url: String,
    name: String,
    key: String,
    group: String,
    consumer: String,
    role: Role,
    max_len: Option<usize>,
    claim_idle: Duration,
    conn: Option<MultiplexedConnection>,
    /// While set, our own pending entries after this id are re-read
    reread_after: Option<String>,
}

fn record_from_entry(entry: &StreamId) -> Result<TaskRecord, TaskError> {
    let mut record = TaskRecord::new();
    for (field, value) in &entry.map {
        let text: String = redis::from_redis_value(value).map_err(|e| {
            TaskError::InvalidPayload(format!("field {} of entry {}: {}", field, entry.id, e))
        })?;
        record.insert(field.clone(), text);
    }
    Ok(record)
}

fn delivery_from_entry(entry: &StreamId) -> Delivery {
    Delivery {
        handle: DeliveryHandle::stream_entry(entry.id.clone()),
        record: record_from_entry(entry),
    }
}

/// Pending entries idle for at least `min_idle_ms`, oldest first
fn claimable(pending: &[StreamPendingId], min_idle_ms: usize) -> Vec<&StreamPendingId> {
    pending
        .iter()
        .filter(|p| p.last_delivered_ms >= min_idle_ms)
        .collect()
}

fn first_entry(reply: Option<StreamReadReply>) -> Option<StreamId> {
    reply?.keys.into_iter().next()?.ids.into_iter().next()
}

impl RedisStreamBroker {
    pub fn new(config: &RedisConfig, name: &str, role: Role, group: &str, consumer: &str) -> Self {
        Self {
            url: config.url.clone(),
            name: name.to_string(),
            key: format!("stream:{}", name),
            group: group.to_string(),
            consumer: consumer.to_string(),
            role,
            max_len: config.stream_max_len,
            claim_idle: config.claim_idle(),
            conn: None,
            reread_after: None,
        }
    }

    fn conn(&mut self) -> Result<&mut MultiplexedConnection, BrokerError> {
        self.conn.as_mut().ok_or(BrokerError::NotConnected)
    }

    async fn ensure_group(&mut self) -> Result<(), BrokerError> {
        let key = self.key.clone();
        let group = self.group.clone();
        let created: RedisResult<()> = self.conn()?.xgroup_create_mkstream(&key, &group, "0").await;

        match created {
            Ok(()) => {
                info!(stream = %key, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }

    async fn read_own_pending(&mut self, after: String) -> Result<Option<StreamId>, BrokerError> {
        let key = self.key.clone();
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        let reply: Option<StreamReadReply> = self
            .conn()?
            .xread_options(&[&key], &[&after], &opts)
            .await
            .map_err(map_redis_error)?;
        Ok(first_entry(reply))
    }

    async fn claim_idle_entry(&mut self) -> Result<Option<StreamId>, BrokerError> {
        let key = self.key.clone();
        let group = self.group.clone();
        let consumer = self.consumer.clone();
        let min_idle = self.claim_idle.as_millis() as usize;
        let conn = self.conn()?;

        let pending: StreamPendingCountReply = conn
            .xpending_count(&key, &group, "-", "+", CLAIM_SCAN)
            .await
            .map_err(map_redis_error)?;

        for candidate in claimable(&pending.ids, min_idle) {
            // XCLAIM re-checks the idle time, so a racing member wins cleanly.
            let claimed: StreamClaimReply = conn
                .xclaim(&key, &group, &consumer, min_idle, &[&candidate.id])
                .await
                .map_err(map_redis_error)?;

            if let Some(entry) = claimed.ids.into_iter().next() {
                debug!(
                    stream = %key,
                    id = %entry.id,
                    from = %candidate.consumer,
                    times_delivered = candidate.times_delivered,
                    "Claimed idle entry"
                );
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    async fn read_new(&mut self, timeout: Duration) -> Result<Option<StreamId>, BrokerError> {
        let key = self.key.clone();
        // BLOCK 0 would wait forever.
        let block_ms = (timeout.as_millis() as usize).max(1);
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(block_ms);
        let reply: Option<StreamReadReply> = self
            .conn()?
            .xread_options(&[&key], &[">"], &opts)
            .await
            .map_err(map_redis_error)?;
        Ok(first_entry(reply))
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    fn backend(&self) -> &'static str {
        "redis_stream"
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
            if let Err(e) = self.ensure_group().await {
                self.conn = None;
                return Err(e);
            }
            self.reread_after = Some("0".to_string());
        }

        Ok(())
    }

    async fn publish(&mut self, _key: &str, record: &TaskRecord) -> Result<(), BrokerError> {
        let key = self.key.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&key);
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in record.iter() {
            cmd.arg(field).arg(value);
        }

        let id: String = cmd
            .query_async(self.conn()?)
            .await
            .map_err(map_redis_error)?;
        debug!(stream = %key, id = %id, "Added entry");
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        if self.role != Role::Consumer {
            return Err(BrokerError::Unsupported(
                "producer-role broker cannot consume".to_string(),
            ));
        }

        if let Some(after) = self.reread_after.take() {
            if let Some(entry) = self.read_own_pending(after).await? {
                self.reread_after = Some(entry.id.clone());
                return Ok(Some(delivery_from_entry(&entry)));
            }
        }

        if let Some(entry) = self.claim_idle_entry().await? {
            return Ok(Some(delivery_from_entry(&entry)));
        }

        Ok(self.read_new(timeout).await?.map(|entry| delivery_from_entry(&entry)))
    }

    async fn acknowledge(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        let HandleKind::StreamEntry { id } = &handle.kind else {
            return Err(handle.mismatch(self.backend()));
        };

        let key = self.key.clone();
        let group = self.group.clone();
        let acked: i64 = self
            .conn()?
            .xack(&key, &group, &[id])
            .await
            .map_err(map_redis_error)?;
        debug!(stream = %key, id = %id, acked, "Acknowledged entry");
        Ok(())
    }

    async fn release(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        if !matches!(handle.kind, HandleKind::StreamEntry { .. }) {
            return Err(handle.mismatch(self.backend()));
        }
        // The entry stays pending under our name; re-read it next time.
        self.reread_after = Some("0".to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.conn = None;
        self.reread_after = None;
        Ok(())
    }
}
