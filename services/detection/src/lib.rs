//! Frame Detection - verifies, infers and persists one frame at a time
//!
//! Consumes `FrameTask`s. Each frame is checked against the digest recorded
//! at extraction, sent to the inference pool, and its `DetectionResult` is
//! appended to the result sink before the task is acknowledged. Corrupted
//! frames are dropped without inference; everything else that fails is left
//! for redelivery.

pub mod config;
pub mod detector;
pub mod inference_pool;
pub mod worker;

pub use config::{DetectionConfig, InferenceConfig};
pub use detector::{parse_response, Detector, DetectorError, HttpDetector};
pub use inference_pool::InferencePool;
pub use worker::{DetectionHandler, FrameState};
