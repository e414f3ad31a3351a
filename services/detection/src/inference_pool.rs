//! Bounded pool of dedicated inference threads.
//!
//! Callers submit encoded frames over a bounded channel and suspend only on
//! their own reply. Inference never runs on the async runtime, so broker
//! polling and acknowledgment are not starved by a slow model.

use crate::detector::{Detector, DetectorError};
use frame_pipeline::Detection;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

struct Job {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<Detection>, DetectorError>>,
}

pub struct InferencePool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InferencePool {
    /// Start `workers` threads sharing `detector`, with room for `capacity`
    /// queued requests
    pub fn new(detector: Arc<dyn Detector>, workers: usize, capacity: usize) -> Result<Self, DetectorError> {
        let (sender, receiver) = mpsc::channel::<Job>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers.max(1));
        for id in 0..workers.max(1) {
            let detector = Arc::clone(&detector);
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("inference-{}", id))
                .spawn(move || worker_loop(id, detector, receiver))
                .map_err(|e| DetectorError::Unavailable(format!("Failed to spawn inference thread: {}", e)))?;
            handles.push(handle);
        }

        info!(workers = handles.len(), capacity = capacity.max(1), "Inference pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        })
    }

    /// Run inference on a pool thread and wait for its result
    pub async fn infer(&self, image: Vec<u8>) -> Result<Vec<Detection>, DetectorError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| DetectorError::Unavailable("pool is shut down".to_string()))?;

        let (reply, result) = oneshot::channel();
        sender
            .send(Job { image, reply })
            .await
            .map_err(|_| DetectorError::Unavailable("inference threads have exited".to_string()))?;

        result
            .await
            .map_err(|_| DetectorError::Unavailable("inference thread dropped the request".to_string()))?
    }

    /// Stop accepting work, let queued requests finish, and join the threads
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }

        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    error!("Inference thread panicked");
                }
            }
        })
        .await;

        match joined {
            Ok(()) => info!("Inference pool stopped"),
            Err(e) => warn!(error = %e, "Failed to join inference threads"),
        }
    }
}

impl Drop for InferencePool {
    fn drop(&mut self) {
        // Threads exit once the queue drains
        self.sender.lock().take();
    }
}

fn worker_loop(id: usize, detector: Arc<dyn Detector>, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    debug!(worker = id, "Inference thread started");

    loop {
        let job = receiver.lock().blocking_recv();
        let Some(job) = job else {
            break;
        };

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| detector.infer(&job.image)))
            .unwrap_or_else(|_| Err(DetectorError::Model("detector panicked".to_string())));
        metrics::histogram!("detection.inference_seconds").record(started.elapsed().as_secs_f64());

        if job.reply.send(result).is_err() {
            debug!(worker = id, "Caller stopped waiting for inference result");
        }
    }

    debug!(worker = id, "Inference thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::MockDetector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn person() -> Detection {
        Detection::new("person", 0.9, [0.1, 0.1, 0.5, 0.5])
    }

    #[tokio::test]
    async fn test_infer_returns_detector_output() {
        let mut detector = MockDetector::new();
        detector
            .expect_infer()
            .withf(|image| image == &b"frame"[..])
            .times(1)
            .returning(|_| Ok(vec![person()]));

        let pool = InferencePool::new(Arc::new(detector), 1, 1).unwrap();
        assert_eq!(pool.infer(b"frame".to_vec()).await.unwrap(), vec![person()]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_detector_errors_are_passed_through() {
        let mut detector = MockDetector::new();
        detector
            .expect_infer()
            .returning(|_| Err(DetectorError::Model("out of memory".to_string())));

        let pool = InferencePool::new(Arc::new(detector), 1, 1).unwrap();
        assert!(matches!(
            pool.infer(b"frame".to_vec()).await,
            Err(DetectorError::Model(_))
        ));
        pool.shutdown().await;
    }

    struct Panicky {
        calls: AtomicUsize,
    }

    impl Detector for Panicky {
        fn infer(&self, _image: &[u8]) -> Result<Vec<Detection>, DetectorError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("model crashed");
            }
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_pool_survives_detector_panic() {
        let pool = InferencePool::new(Arc::new(Panicky { calls: AtomicUsize::new(0) }), 1, 1).unwrap();

        assert!(matches!(
            pool.infer(b"a".to_vec()).await,
            Err(DetectorError::Model(_))
        ));
        assert!(pool.infer(b"b".to_vec()).await.unwrap().is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_infer_after_shutdown_is_unavailable() {
        let pool = InferencePool::new(Arc::new(MockDetector::new()), 2, 1).unwrap();
        pool.shutdown().await;
        assert!(matches!(
            pool.infer(b"frame".to_vec()).await,
            Err(DetectorError::Unavailable(_))
        ));
    }

    struct Slow {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Detector for Slow {
        fn infer(&self, _image: &[u8]) -> Result<Vec<Detection>, DetectorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_worker_never_runs_inference_concurrently() {
        let detector = Arc::new(Slow {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let pool = Arc::new(InferencePool::new(detector.clone(), 1, 4).unwrap());

        let mut calls = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            calls.push(tokio::spawn(async move { pool.infer(vec![0]).await }));
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(detector.max_in_flight.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }
}
