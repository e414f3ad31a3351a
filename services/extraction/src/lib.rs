//! Frame Extraction - turns uploaded videos into frame tasks
//!
//! Consumes `VideoTask`s, decodes each video, keeps one frame every
//! `sample_period_secs`, stores it as JPEG and publishes a `FrameTask` for
//! it. The video task is acknowledged only after every frame task was
//! accepted by the broker, so a crash mid-video re-extracts the whole video.
//! Frame references are deterministic, so re-extraction overwrites.

pub mod config;
pub mod decoder;
pub mod extractor;
pub mod worker;

pub use config::{ExtractionConfig, ExtractionSettings};
pub use decoder::{DecodeError, FrameSource, GstVideoDecoder, RgbFrame, SyntheticVideo, VideoDecoder};
pub use extractor::{sampling_interval, EncodedFrame, ExtractError, FrameEncoder, FrameSampler};
pub use worker::ExtractionHandler;
