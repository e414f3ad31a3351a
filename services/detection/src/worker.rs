//! Detection stage handler.
//!
//! Per frame task:
//!
//! ```text
//! Received -> IntegrityChecked -> Inferred -> Persisted -> (Acknowledged)
//!                    |
//!                    +-> Dropped (digest mismatch)
//! ```
//!
//! The consumer loop acknowledges once the handler returns `Ok`, i.e. after
//! `Persisted`. A failure before that leaves the task redeliverable, except
//! a missing or corrupted frame, which redelivery cannot repair.

use crate::inference_pool::InferencePool;
use frame_pipeline::integrity::{self, IntegrityError};
use frame_pipeline::{async_trait, DetectionResult, FrameStore, FrameTask, PipelineError, ResultSink, TaskHandler};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// How far a frame task got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Received,
    IntegrityChecked,
    /// Terminal: the frame will never verify
    Dropped,
    Inferred,
    Persisted,
}

impl FrameState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameState::Received => "received",
            FrameState::IntegrityChecked => "integrity_checked",
            FrameState::Dropped => "dropped",
            FrameState::Inferred => "inferred",
            FrameState::Persisted => "persisted",
        }
    }

    /// Whether `next` directly follows this state
    pub fn can_advance_to(self, next: FrameState) -> bool {
        matches!(
            (self, next),
            (FrameState::Received, FrameState::IntegrityChecked)
                | (FrameState::IntegrityChecked, FrameState::Dropped)
                | (FrameState::IntegrityChecked, FrameState::Inferred)
                | (FrameState::Inferred, FrameState::Persisted)
        )
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame task moving through [`FrameState`]s
struct FrameProgress {
    state: FrameState,
}

impl FrameProgress {
    fn new() -> Self {
        Self {
            state: FrameState::Received,
        }
    }

    fn advance(&mut self, next: FrameState) {
        debug_assert!(self.state.can_advance_to(next), "{} -> {}", self.state, next);
        debug!(from = %self.state, to = %next, "Frame state");
        self.state = next;
    }
}

pub struct DetectionHandler {
    store: Arc<dyn FrameStore>,
    pool: Arc<InferencePool>,
    sink: Arc<dyn ResultSink>,
}

impl DetectionHandler {
    pub fn new(store: Arc<dyn FrameStore>, pool: Arc<InferencePool>, sink: Arc<dyn ResultSink>) -> Self {
        Self { store, pool, sink }
    }

    /// Run one frame task, reporting the last state it reached
    pub async fn process(&self, task: &FrameTask) -> (FrameState, Result<(), PipelineError>) {
        let mut progress = FrameProgress::new();
        let result = self.advance(task, &mut progress).await;
        (progress.state, result)
    }

    async fn advance(&self, task: &FrameTask, progress: &mut FrameProgress) -> Result<(), PipelineError> {
        let bytes = self.store.read(&task.frame_path).await?;

        if let Err(IntegrityError::Mismatch { expected, actual }) = integrity::verify(&bytes, &task.frame_hash) {
            progress.advance(FrameState::IntegrityChecked);
            progress.advance(FrameState::Dropped);
            metrics::counter!("detection.corrupted_frames").increment(1);
            return Err(PipelineError::Corruption {
                frame_path: task.frame_path.clone(),
                expected,
                actual,
            });
        }
        progress.advance(FrameState::IntegrityChecked);

        let detections = self
            .pool
            .infer(bytes)
            .await
            .map_err(|e| PipelineError::TransientInference(e.to_string()))?;
        progress.advance(FrameState::Inferred);

        let result = DetectionResult::for_frame(task, detections);
        self.sink.append(&result).await?;
        progress.advance(FrameState::Persisted);

        metrics::counter!("detection.frames_processed").increment(1);
        metrics::counter!("detection.objects_detected").increment(result.detections.len() as u64);
        info!(
            frame_index = task.frame_index,
            detections = result.detections.len(),
            "Saved detections for frame"
        );
        Ok(())
    }
}

#[async_trait]
impl TaskHandler<FrameTask> for DetectionHandler {
    #[instrument(skip(self, task), fields(video_id = %task.video_id, frame_index = task.frame_index))]
    async fn handle(&self, task: &FrameTask) -> Result<(), PipelineError> {
        let started = Instant::now();
        let (state, result) = self.process(task).await;

        if let Err(e) = &result {
            debug!(state = %state, error = %e, "Frame task stopped early");
        }
        metrics::histogram!("detection.frame_seconds", "state" => state.as_str())
            .record(started.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectorError, MockDetector};
    use frame_pipeline::broker::{Broker, MemoryBus, MemorySemantics, Role};
    use frame_pipeline::{
        Detection, Disposition, DropReason, MemoryResultSink, MemoryStore, RetryPolicy, TaskConsumer, WireTask,
    };
    use std::time::Duration;

    const JPEG: &[u8] = b"\xFF\xD8 frame bytes \xFF\xD9";

    fn person() -> Detection {
        Detection::new("person", 0.9, [0.1, 0.1, 0.5, 0.5])
    }

    fn stored_frame(store: &MemoryStore) -> FrameTask {
        store.insert("frames/v1/30.jpg", JPEG.to_vec());
        FrameTask {
            video_id: "v1".to_string(),
            frame_path: "frames/v1/30.jpg".to_string(),
            frame_index: 30,
            frame_hash: integrity::digest(JPEG),
            video_hash: "ab".repeat(32),
        }
    }

    fn handler(store: &MemoryStore, detector: MockDetector, sink: &MemoryResultSink) -> DetectionHandler {
        let pool = InferencePool::new(Arc::new(detector), 1, 1).unwrap();
        DetectionHandler::new(Arc::new(store.clone()), Arc::new(pool), Arc::new(sink.clone()))
    }

    #[test]
    fn test_state_transitions() {
        use FrameState::*;
        assert!(Received.can_advance_to(IntegrityChecked));
        assert!(IntegrityChecked.can_advance_to(Dropped));
        assert!(IntegrityChecked.can_advance_to(Inferred));
        assert!(Inferred.can_advance_to(Persisted));
        assert!(!Received.can_advance_to(Inferred));
        assert!(!Dropped.can_advance_to(Inferred));
        assert!(!Persisted.can_advance_to(Received));
    }

    #[tokio::test]
    async fn test_verified_frame_is_persisted() {
        let store = MemoryStore::new();
        let sink = MemoryResultSink::new();
        let mut detector = MockDetector::new();
        detector
            .expect_infer()
            .withf(|image| image == JPEG)
            .times(1)
            .returning(|_| Ok(vec![person()]));

        let task = stored_frame(&store);
        let (state, result) = handler(&store, detector, &sink).process(&task).await;

        assert_eq!(state, FrameState::Persisted);
        result.unwrap();
        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].frame_index, 30);
        assert_eq!(results[0].detections, vec![person()]);
    }

    #[tokio::test]
    async fn test_corrupted_frame_skips_inference() {
        let store = MemoryStore::new();
        let sink = MemoryResultSink::new();
        let mut detector = MockDetector::new();
        detector.expect_infer().times(0);

        let mut task = stored_frame(&store);
        task.frame_hash = "deadbeef".to_string();
        let (state, result) = handler(&store, detector, &sink).process(&task).await;

        assert_eq!(state, FrameState::Dropped);
        match result {
            Err(PipelineError::Corruption { expected, actual, .. }) => {
                assert_eq!(expected, "deadbeef");
                assert_eq!(actual, integrity::digest(JPEG));
            }
            other => panic!("expected corruption, got {:?}", other),
        }
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_missing_frame_is_missing_source() {
        let store = MemoryStore::new();
        let sink = MemoryResultSink::new();
        let mut detector = MockDetector::new();
        detector.expect_infer().times(0);

        let mut task = stored_frame(&store);
        task.frame_path = "frames/v1/60.jpg".to_string();
        let (state, result) = handler(&store, detector, &sink).process(&task).await;

        assert_eq!(state, FrameState::Received);
        assert!(matches!(result, Err(PipelineError::MissingSource(_))));
    }

    #[tokio::test]
    async fn test_inference_failure_is_transient() {
        let store = MemoryStore::new();
        let sink = MemoryResultSink::new();
        let mut detector = MockDetector::new();
        detector
            .expect_infer()
            .returning(|_| Err(DetectorError::Request("connection refused".to_string())));

        let task = stored_frame(&store);
        let (state, result) = handler(&store, detector, &sink).process(&task).await;

        assert_eq!(state, FrameState::IntegrityChecked);
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::TransientInference(_)));
        assert!(!err.is_terminal());
        assert!(sink.is_empty());
    }

    fn all_semantics() -> Vec<MemorySemantics> {
        vec![
            MemorySemantics::List,
            MemorySemantics::Stream {
                claim_idle: Duration::from_secs(60),
            },
            MemorySemantics::Log { partitions: 2 },
        ]
    }

    async fn consumer_with_task(
        bus: &MemoryBus,
        semantics: MemorySemantics,
        task: &FrameTask,
    ) -> TaskConsumer<FrameTask> {
        let mut producer = bus.broker(semantics, "frame-tasks", Role::Producer, "x", "extractor");
        producer.connect().await.unwrap();
        producer.publish(task.partition_key(), &task.to_record()).await.unwrap();

        let mut consumer = TaskConsumer::new(
            Box::new(bus.broker(semantics, "frame-tasks", Role::Consumer, "detection-group", "detector-1")),
            Duration::from_millis(50),
        );
        consumer.start(&RetryPolicy::default()).await.unwrap();
        consumer
    }

    #[tokio::test]
    async fn test_sink_outage_leaves_task_for_redelivery() {
        for semantics in all_semantics() {
            let bus = MemoryBus::new();
            let store = MemoryStore::new();
            let sink = MemoryResultSink::new();
            let mut detector = MockDetector::new();
            detector.expect_infer().times(2).returning(|_| Ok(vec![person()]));

            let task = stored_frame(&store);
            let handler = handler(&store, detector, &sink);
            let mut consumer = consumer_with_task(&bus, semantics, &task).await;

            sink.set_unavailable(true);
            assert!(consumer.process_next(&handler).await.is_err(), "{:?}", semantics);
            assert_eq!(bus.outstanding("frame-tasks"), 1, "{:?}", semantics);
            assert!(sink.is_empty());

            sink.set_unavailable(false);
            let disposition = consumer.process_next(&handler).await.unwrap();
            assert_eq!(disposition, Some(Disposition::Acknowledged), "{:?}", semantics);
            assert_eq!(bus.outstanding("frame-tasks"), 0, "{:?}", semantics);
            assert_eq!(sink.len(), 1, "{:?}", semantics);
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_acknowledged_and_dropped() {
        for semantics in all_semantics() {
            let bus = MemoryBus::new();
            let store = MemoryStore::new();
            let sink = MemoryResultSink::new();
            let mut detector = MockDetector::new();
            detector.expect_infer().times(0);

            let mut task = stored_frame(&store);
            task.frame_hash = "deadbeef".to_string();
            let handler = handler(&store, detector, &sink);
            let mut consumer = consumer_with_task(&bus, semantics, &task).await;

            let disposition = consumer.process_next(&handler).await.unwrap();
            assert_eq!(
                disposition,
                Some(Disposition::Dropped(DropReason::Corrupted)),
                "{:?}",
                semantics
            );
            assert_eq!(bus.outstanding("frame-tasks"), 0, "{:?}", semantics);
            assert!(sink.is_empty());
        }
    }
}
