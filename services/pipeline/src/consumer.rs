//! Typed consumer and the stage loop.
//!
//! [`TaskConsumer::process_next`] is where acknowledgment policy lives:
//!
//! | outcome                      | acked | logged at |
//! |------------------------------|-------|-----------|
//! | handler succeeded            | yes   | debug     |
//! | malformed payload            | yes   | error     |
//! | corrupted frame              | yes   | error     |
//! | missing / undecodable source | yes   | warn      |
//! | transient failure            | no    | warn      |
//!
//! A transient failure hands the delivery back to the broker and returns the
//! error so the loop can back off. If the broker refuses to take it back, the
//! session is closed and reopened before the next receive, so the delivery
//! is redelivered from the last commit and nothing later is acknowledged
//! past it.

use crate::broker::{start_with_retry, Broker, BrokerError, DeliveryHandle, RetryPolicy};
use crate::error::{Disposition, DropReason, PipelineError};
use crate::shutdown::Shutdown;
use crate::task::{TaskError, WireTask};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One delivery decoded into a task
#[derive(Debug)]
pub struct Received<T> {
    pub handle: DeliveryHandle,
    pub task: Result<T, TaskError>,
}

/// Stage logic for one task kind
#[async_trait]
pub trait TaskHandler<T: WireTask>: Send + Sync {
    /// Process a task. `Ok` means the task may be acknowledged.
    async fn handle(&self, task: &T) -> Result<(), PipelineError>;

    /// Runs after a successful acknowledgment; failures here must not
    /// affect delivery
    async fn after_acknowledge(&self, _task: &T) {}
}

/// Outcome counts of a [`TaskConsumer::run`] loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub acknowledged: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Receives tasks of one kind from one queue. Owns its broker.
pub struct TaskConsumer<T: WireTask> {
    broker: Box<dyn Broker>,
    poll_timeout: Duration,
    error_backoff: Duration,
    policy: RetryPolicy,
    /// Set when a delivery could not be released; cleared by reconnecting
    session_lost: bool,
    _task: PhantomData<fn() -> T>,
}

impl<T: WireTask> TaskConsumer<T> {
    /// Wrap a broker built with [`crate::broker::Role::Consumer`]
    pub fn new(broker: Box<dyn Broker>, poll_timeout: Duration) -> Self {
        Self {
            broker,
            poll_timeout,
            error_backoff: Duration::from_secs(1),
            policy: RetryPolicy::default(),
            session_lost: false,
            _task: PhantomData,
        }
    }

    /// Pause after a failed iteration of [`TaskConsumer::run`]
    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn queue(&self) -> &str {
        self.broker.queue()
    }

    pub async fn start(&mut self, policy: &RetryPolicy) -> Result<(), BrokerError> {
        self.policy = policy.clone();
        start_with_retry(self.broker.as_mut(), policy).await?;
        info!(queue = %self.broker.queue(), kind = T::KIND, "Consumer started");
        Ok(())
    }

    /// Reopen the broker session after a delivery could not be handed back
    async fn restore_session(&mut self) -> Result<(), BrokerError> {
        if !self.session_lost {
            return Ok(());
        }

        warn!(queue = %self.broker.queue(), "Reopening broker session to recover unreleased delivery");
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker session");
        }
        start_with_retry(self.broker.as_mut(), &self.policy).await?;
        self.session_lost = false;
        metrics::counter!("consumer.session_restarts", "kind" => T::KIND).increment(1);
        Ok(())
    }

    /// Wait up to the poll timeout for the next task
    pub async fn receive(&mut self) -> Result<Option<Received<T>>, BrokerError> {
        let Some(delivery) = self.broker.receive(self.poll_timeout).await? else {
            return Ok(None);
        };

        let task = delivery.record.and_then(|record| T::from_record(&record));
        Ok(Some(Received {
            handle: delivery.handle,
            task,
        }))
    }

    pub async fn acknowledge(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        self.broker.acknowledge(handle).await
    }

    /// Receive and process at most one task.
    ///
    /// Returns `Ok(None)` when nothing arrived within the poll timeout.
    pub async fn process_next(
        &mut self,
        handler: &dyn TaskHandler<T>,
    ) -> Result<Option<Disposition>, PipelineError> {
        self.restore_session().await?;
        let Some(received) = self.receive().await? else {
            return Ok(None);
        };
        let handle = received.handle;

        let task = match received.task {
            Ok(task) => task,
            Err(e) => {
                error!(queue = %self.broker.queue(), kind = T::KIND, error = %e, "Dropping malformed task");
                return self.drop_delivery(&handle, DropReason::Malformed).await;
            }
        };

        let started = Instant::now();
        match handler.handle(&task).await {
            Ok(()) => {
                self.acknowledge(&handle).await?;
                metrics::counter!("consumer.acknowledged", "kind" => T::KIND).increment(1);
                metrics::histogram!("consumer.handle_seconds", "kind" => T::KIND)
                    .record(started.elapsed().as_secs_f64());
                debug!(kind = T::KIND, key = %task.partition_key(), "Task acknowledged");

                handler.after_acknowledge(&task).await;
                Ok(Some(Disposition::Acknowledged))
            }
            Err(e) => match e.drop_reason() {
                Some(reason) => {
                    log_terminal(&e, task.partition_key());
                    self.drop_delivery(&handle, reason).await
                }
                None => {
                    warn!(
                        kind = T::KIND,
                        key = %task.partition_key(),
                        error = %e,
                        "Task failed, leaving it for redelivery"
                    );
                    metrics::counter!("consumer.failures", "kind" => T::KIND).increment(1);
                    if let Err(release_err) = self.broker.release(&handle).await {
                        error!(error = %release_err, "Failed to release delivery, session will be reopened");
                        self.session_lost = true;
                    }
                    Err(e)
                }
            },
        }
    }

    async fn drop_delivery(
        &mut self,
        handle: &DeliveryHandle,
        reason: DropReason,
    ) -> Result<Option<Disposition>, PipelineError> {
        self.acknowledge(handle).await?;
        metrics::counter!("consumer.dropped", "kind" => T::KIND, "reason" => reason.as_str())
            .increment(1);
        Ok(Some(Disposition::Dropped(reason)))
    }

    /// Process tasks until shutdown. Errors never end the loop: they are
    /// logged and followed by a pause of `error_backoff`.
    pub async fn run(&mut self, handler: &dyn TaskHandler<T>, shutdown: &Shutdown) -> LoopStats {
        let mut stats = LoopStats::default();
        info!(queue = %self.broker.queue(), kind = T::KIND, "Starting consumption loop");

        while !shutdown.is_triggered() {
            match self.process_next(handler).await {
                Ok(None) => {}
                Ok(Some(Disposition::Acknowledged)) => stats.acknowledged += 1,
                Ok(Some(Disposition::Dropped(_))) => stats.dropped += 1,
                Err(e) => {
                    stats.failed += 1;
                    error!(queue = %self.broker.queue(), error = %e, "Iteration failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_backoff) => {}
                        _ = shutdown.wait() => {}
                    }
                }
            }
        }

        info!(
            queue = %self.broker.queue(),
            acknowledged = stats.acknowledged,
            dropped = stats.dropped,
            failed = stats.failed,
            "Consumption loop stopped"
        );
        stats
    }

    pub async fn stop(&mut self) -> Result<(), BrokerError> {
        info!(queue = %self.broker.queue(), "Stopping consumer");
        self.broker.close().await
    }
}

fn log_terminal(err: &PipelineError, key: &str) {
    match err {
        PipelineError::Corruption {
            frame_path,
            expected,
            actual,
        } => error!(
            key = %key,
            frame_path = %frame_path,
            expected = %expected,
            actual = %actual,
            "Frame digest mismatch, dropping task"
        ),
        PipelineError::MalformedTask(reason) => {
            error!(key = %key, reason = %reason, "Dropping malformed task")
        }
        PipelineError::MissingSource(reference) => {
            warn!(key = %key, reference = %reference, "Source missing, dropping task")
        }
        other => warn!(key = %key, error = %other, "Dropping task"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Delivery, MemoryBroker, MemoryBus, MemorySemantics, Role};
    use crate::task::{TaskRecord, VideoTask};
    use parking_lot::Mutex;

    const POLL: Duration = Duration::from_millis(50);

    /// Returns queued outcomes in order, then succeeds
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<Vec<Result<(), PipelineError>>>,
        handled: Mutex<Vec<String>>,
        after_ack: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with(outcomes: Vec<Result<(), PipelineError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TaskHandler<VideoTask> for Scripted {
        async fn handle(&self, task: &VideoTask) -> Result<(), PipelineError> {
            self.handled.lock().push(task.video_id.clone());
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                Ok(())
            } else {
                outcomes.remove(0)
            }
        }

        async fn after_acknowledge(&self, task: &VideoTask) {
            self.after_ack.lock().push(task.video_id.clone());
        }
    }

    async fn setup(bus: &MemoryBus) -> (Box<dyn Broker>, TaskConsumer<VideoTask>) {
        let mut producer = bus.broker(MemorySemantics::List, "videos", Role::Producer, "g", "p");
        producer.connect().await.unwrap();
        let mut consumer = TaskConsumer::new(
            Box::new(bus.broker(MemorySemantics::List, "videos", Role::Consumer, "g", "c")),
            POLL,
        );
        consumer.start(&RetryPolicy::default()).await.unwrap();
        (Box::new(producer), consumer)
    }

    /// Memory broker whose first `release` fails
    struct StuckRelease {
        inner: MemoryBroker,
        fail_release: bool,
    }

    #[async_trait]
    impl Broker for StuckRelease {
        fn backend(&self) -> &'static str {
            self.inner.backend()
        }

        fn queue(&self) -> &str {
            self.inner.queue()
        }

        async fn connect(&mut self) -> Result<(), BrokerError> {
            self.inner.connect().await
        }

        async fn publish(&mut self, key: &str, record: &TaskRecord) -> Result<(), BrokerError> {
            self.inner.publish(key, record).await
        }

        async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
            self.inner.receive(timeout).await
        }

        async fn acknowledge(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
            self.inner.acknowledge(handle).await
        }

        async fn release(&mut self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
            if std::mem::take(&mut self.fail_release) {
                return Err(BrokerError::Connection("connection reset".into()));
            }
            self.inner.release(handle).await
        }

        async fn close(&mut self) -> Result<(), BrokerError> {
            self.inner.close().await
        }
    }

    async fn publish(producer: &mut Box<dyn Broker>, task: &VideoTask) {
        producer.publish(&task.video_id, &task.to_record()).await.unwrap();
    }

    #[tokio::test]
    async fn test_success_acks_then_runs_hook() {
        let bus = MemoryBus::new();
        let (mut producer, mut consumer) = setup(&bus).await;
        publish(&mut producer, &VideoTask::new("v1", "videos/v1.mp4")).await;

        let handler = Scripted::default();
        let outcome = consumer.process_next(&handler).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Acknowledged));
        assert_eq!(*handler.after_ack.lock(), vec!["v1".to_string()]);
        assert_eq!(bus.outstanding("videos"), 0);
    }

    #[tokio::test]
    async fn test_malformed_is_acked_without_handler() {
        let bus = MemoryBus::new();
        let (mut producer, mut consumer) = setup(&bus).await;
        producer
            .publish("x", &TaskRecord::new().with("video_id", "v1"))
            .await
            .unwrap();

        let handler = Scripted::default();
        let outcome = consumer.process_next(&handler).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Dropped(DropReason::Malformed)));
        assert!(handler.handled.lock().is_empty());
        assert_eq!(bus.outstanding("videos"), 0);
    }

    #[tokio::test]
    async fn test_terminal_error_is_acked_without_hook() {
        let bus = MemoryBus::new();
        let (mut producer, mut consumer) = setup(&bus).await;
        publish(&mut producer, &VideoTask::new("v1", "videos/v1.mp4")).await;

        let handler = Scripted::with(vec![Err(PipelineError::MissingSource("videos/v1.mp4".into()))]);
        let outcome = consumer.process_next(&handler).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Dropped(DropReason::MissingSource)));
        assert!(handler.after_ack.lock().is_empty());
        assert_eq!(bus.outstanding("videos"), 0);
    }

    #[tokio::test]
    async fn test_transient_error_is_redelivered() {
        let bus = MemoryBus::new();
        let (mut producer, mut consumer) = setup(&bus).await;
        publish(&mut producer, &VideoTask::new("v1", "videos/v1.mp4")).await;

        let handler = Scripted::with(vec![Err(PipelineError::TransientStorage("db down".into()))]);
        let err = consumer.process_next(&handler).await.unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(bus.outstanding("videos"), 1);

        let outcome = consumer.process_next(&handler).await.unwrap();
        assert_eq!(outcome, Some(Disposition::Acknowledged));
        assert_eq!(*handler.handled.lock(), vec!["v1".to_string(), "v1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_release_reopens_session_before_next_task() {
        let bus = MemoryBus::new();
        let semantics = MemorySemantics::Log { partitions: 1 };
        let mut producer: Box<dyn Broker> =
            Box::new(bus.broker(semantics, "videos", Role::Producer, "g", "p"));
        producer.connect().await.unwrap();
        let mut consumer = TaskConsumer::<VideoTask>::new(
            Box::new(StuckRelease {
                inner: bus.broker(semantics, "videos", Role::Consumer, "g", "c"),
                fail_release: true,
            }),
            POLL,
        );
        consumer.start(&RetryPolicy::default()).await.unwrap();
        publish(&mut producer, &VideoTask::new("v1", "videos/v1.mp4")).await;
        publish(&mut producer, &VideoTask::new("v2", "videos/v2.mp4")).await;

        let handler = Scripted::with(vec![Err(PipelineError::TransientStorage("db down".into()))]);
        assert!(consumer.process_next(&handler).await.is_err());

        // v1 comes back before v2 can be acknowledged past it
        while consumer.process_next(&handler).await.unwrap().is_some() {}
        assert_eq!(
            *handler.handled.lock(),
            vec!["v1".to_string(), "v1".to_string(), "v2".to_string()]
        );
        assert_eq!(bus.outstanding("videos"), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_times_out() {
        let bus = MemoryBus::new();
        let (_producer, mut consumer) = setup(&bus).await;
        let outcome = consumer.process_next(&Scripted::default()).await.unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn test_run_survives_failures_and_stops() {
        let bus = MemoryBus::new();
        let (mut producer, consumer) = setup(&bus).await;
        let mut consumer = consumer.with_error_backoff(Duration::from_millis(5));
        publish(&mut producer, &VideoTask::new("v1", "videos/v1.mp4")).await;
        publish(&mut producer, &VideoTask::new("v2", "videos/v2.mp4")).await;

        let handler = Scripted::with(vec![Err(PipelineError::TransientStorage("blip".into()))]);
        let shutdown = Shutdown::new();
        let stopper = {
            let shutdown = shutdown.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                while bus.outstanding("videos") > 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                shutdown.trigger();
            })
        };

        let stats = consumer.run(&handler, &shutdown).await;
        stopper.await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.acknowledged, 2);
        assert_eq!(bus.outstanding("videos"), 0);
    }
}
