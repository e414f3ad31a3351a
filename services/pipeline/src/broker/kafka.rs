//! Partitioned log on Kafka.
//!
//! Records are JSON objects keyed by `video_id`, so frames of one video stay
//! in one partition. Offsets are never auto-committed: acknowledging a
//! delivery synchronously commits the partition up to its lowest delivery
//! still unresolved, or `offset + 1` when none is.

use super::offsets::PartitionProgress;
use super::{Broker, BrokerError, Delivery, DeliveryHandle, HandleKind, Role};
use crate::config::KafkaConfig;
use crate::task::TaskRecord;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

fn map_kafka_error(err: KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut,
        ) => BrokerError::Timeout(err.to_string()),
        Some(
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::BrokerNotAvailable,
        ) => BrokerError::Connection(err.to_string()),
        _ => BrokerError::Protocol(err.to_string()),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BrokerError>
where
    F: FnOnce() -> Result<T, KafkaError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrokerError::Protocol(format!("kafka worker thread failed: {}", e)))?
        .map_err(map_kafka_error)
}

pub struct KafkaBroker {
    config: KafkaConfig,
    topic: String,
    group: String,
    role: Role,
    producer: Option<FutureProducer>,
    consumer: Option<Arc<StreamConsumer>>,
    progress: HashMap<(String, i32), PartitionProgress>,
}

fn commit_list(topic: &str, partition: i32, position: i64) -> Result<TopicPartitionList, BrokerError> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(topic, partition, Offset::Offset(position))
        .map_err(map_kafka_error)?;
    Ok(tpl)
}

impl KafkaBroker {
    pub fn new(config: &KafkaConfig, topic: &str, role: Role, group: &str) -> Self {
        Self {
            config: config.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            role,
            producer: None,
            consumer: None,
            progress: HashMap::new(),
        }
    }

    fn consumer(&self) -> Result<Arc<StreamConsumer>, BrokerError> {
        match self.role {
            Role::Consumer => self.consumer.clone().ok_or(BrokerError::NotConnected),
            Role::Producer => Err(BrokerError::Unsupported(
                "producer-role broker cannot consume".to_string(),
            )),
        }
    }

    fn log_position<'a>(&self, handle: &'a DeliveryHandle) -> Result<(&'a str, i32, i64), BrokerError> {
        match &handle.kind {
            HandleKind::LogOffset {
                topic,
                partition,
                offset,
            } => Ok((topic.as_str(), *partition, *offset)),
            _ => Err(handle.mismatch(self.backend())),
        }
    }

    async fn connect_producer(&mut self) -> Result<(), BrokerError> {
        let producer: FutureProducer = self
            .config
            .build_producer_config()
            .create()
            .map_err(map_kafka_error)?;

        let metadata_client = producer.clone();
        let topic = self.topic.clone();
        let timeout = self.config.request_timeout();
        blocking(move || {
            metadata_client
                .client()
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map(|_| ())
        })
        .await?;

        self.producer = Some(producer);
        Ok(())
    }

    async fn connect_consumer(&mut self) -> Result<(), BrokerError> {
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config(&self.group)
            .create()
            .map_err(map_kafka_error)?;
        let consumer = Arc::new(consumer);

        let metadata_client = consumer.clone();
        let topic = self.topic.clone();
        let timeout = self.config.request_timeout();
        blocking(move || {
            metadata_client
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map(|_| ())
        })
        .await?;

        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(map_kafka_error)?;

        info!(topic = %self.topic, group = %self.group, "Subscribed to topic");
        self.progress.clear();
        self.consumer = Some(consumer);
        Ok(())
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn backend(&self) -> &'static str {
        "kafka"
    }

    fn queue(&self) -> &str {
        &self.topic
    }

    async fn connect(&mut self) -> Result<(), BrokerError> {
        match self.role {
            Role::Producer if self.producer.is_none() => self.connect_producer().await,
            Role::Consumer if self.consumer.is_none() => self.connect_consumer().await,
            _ => Ok(()),
        }
    }

    #[instrument(skip(self, record), fields(topic = %self.topic))]
    async fn publish(&mut self, key: &str, record: &TaskRecord) -> Result<(), BrokerError> {
        let producer = self.producer.as_ref().ok_or(BrokerError::NotConnected)?;
        let payload = record.to_json();
        let delivery = FutureRecord::to(&self.topic).key(key).payload(&payload);

        let (partition, offset) = producer
            .send(delivery, Timeout::After(self.config.request_timeout()))
            .await
            .map_err(|(e, _)| map_kafka_error(e))?;

        debug!(partition, offset, "Message delivered");
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let consumer = self.consumer()?;

        let message = match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(map_kafka_error(e)),
            Ok(Ok(message)) => message,
        };

        let record = TaskRecord::from_json(message.payload().unwrap_or(&[]));
        self.progress
            .entry((message.topic().to_string(), message.partition()))
            .or_default()
            .delivered(message.offset());
        Ok(Some(Delivery {
            handle: DeliveryHandle::log_offset(message.topic(), message.partition(), message.offset()),
            record,
        }))
    }

    async fn acknowledge(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;
        let (topic, partition, offset) = self.log_position(handle)?;
        let Some(progress) = self.progress.get_mut(&(topic.to_string(), partition)) else {
            warn!(topic, partition, offset, "Acknowledged offset was never delivered here");
            return Ok(());
        };

        let Some(position) = progress.acknowledged(offset) else {
            debug!(
                topic,
                partition,
                offset,
                unresolved = progress.unresolved(),
                "Commit waits for an earlier offset"
            );
            return Ok(());
        };

        let tpl = commit_list(topic, partition, position)?;
        blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await?;
        progress.committed(position);
        debug!(topic, partition, offset, position, "Committed offset");
        Ok(())
    }

    async fn release(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        let consumer = self.consumer()?;
        let (topic, partition, offset) = self.log_position(handle)?;
        let topic = topic.to_string();
        let timeout = self.config.request_timeout();

        // Rewind so the next receive on this partition returns it again.
        blocking(move || consumer.seek(&topic, partition, Offset::Offset(offset), timeout)).await
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.progress.clear();
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        if let Some(producer) = self.producer.take() {
            let timeout = self.config.request_timeout();
            if let Err(e) = blocking(move || producer.flush(Timeout::After(timeout))).await {
                warn!(error = %e, "Failed to flush producer on close");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let timeout = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(matches!(map_kafka_error(timeout), BrokerError::Timeout(_)));

        let down = KafkaError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown);
        assert!(matches!(map_kafka_error(down), BrokerError::Connection(_)));
    }

    #[test]
    fn test_commit_list_targets_one_partition() {
        let tpl = commit_list("frame-tasks", 2, 41).unwrap();
        let elements = tpl.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].topic(), "frame-tasks");
        assert_eq!(elements[0].partition(), 2);
        assert_eq!(elements[0].offset(), Offset::Offset(41));
    }

    #[tokio::test]
    async fn test_wrong_handle_kind_is_rejected() {
        let mut broker = KafkaBroker::new(&KafkaConfig::default(), "frame-tasks", Role::Consumer, "g");
        let handle = DeliveryHandle::list_entry("{}");
        assert!(matches!(broker.log_position(&handle), Err(BrokerError::Unsupported(_))));
        assert!(matches!(
            broker.acknowledge(&handle).await,
            Err(BrokerError::NotConnected)
        ));
    }
}
