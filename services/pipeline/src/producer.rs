//! Typed publisher over a [`Broker`].

use crate::broker::{start_with_retry, Broker, BrokerError, RetryPolicy};
use crate::task::WireTask;
use std::marker::PhantomData;
use tracing::{debug, info, instrument};

/// Publishes tasks of one kind to one queue. Owns its broker.
pub struct TaskProducer<T: WireTask> {
    broker: Box<dyn Broker>,
    _task: PhantomData<fn(T)>,
}

impl<T: WireTask> TaskProducer<T> {
    /// Wrap a broker built with [`crate::broker::Role::Producer`]
    pub fn new(broker: Box<dyn Broker>) -> Self {
        Self {
            broker,
            _task: PhantomData,
        }
    }

    pub fn queue(&self) -> &str {
        self.broker.queue()
    }

    /// Connect, retrying per `policy`
    pub async fn start(&mut self, policy: &RetryPolicy) -> Result<(), BrokerError> {
        start_with_retry(self.broker.as_mut(), policy).await?;
        info!(queue = %self.broker.queue(), kind = T::KIND, "Producer started");
        Ok(())
    }

    /// Publish one task; returns once the broker has accepted it
    #[instrument(skip(self, task), fields(queue = %self.broker.queue(), kind = T::KIND, key = %task.partition_key()))]
    pub async fn publish(&mut self, task: &T) -> Result<(), BrokerError> {
        let record = task.to_record();
        match self.broker.publish(task.partition_key(), &record).await {
            Ok(()) => {
                metrics::counter!("broker.published", "kind" => T::KIND).increment(1);
                debug!("Task published");
                Ok(())
            }
            Err(e) => {
                metrics::counter!("broker.publish_failures", "kind" => T::KIND).increment(1);
                Err(e)
            }
        }
    }

    pub async fn stop(&mut self) -> Result<(), BrokerError> {
        info!(queue = %self.broker.queue(), "Stopping producer");
        self.broker.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBus, MemorySemantics, Role};
    use crate::task::VideoTask;

    #[tokio::test]
    async fn test_publish_before_start_is_rejected() {
        let bus = MemoryBus::new();
        let mut producer: TaskProducer<VideoTask> = TaskProducer::new(Box::new(bus.broker(
            MemorySemantics::List,
            "video-uploads",
            Role::Producer,
            "g",
            "p",
        )));

        let task = VideoTask::new("v1", "videos/v1.mp4");
        assert!(matches!(
            producer.publish(&task).await,
            Err(BrokerError::NotConnected)
        ));

        producer.start(&RetryPolicy::default()).await.unwrap();
        producer.publish(&task).await.unwrap();
        assert_eq!(bus.outstanding("video-uploads"), 1);
    }
}
