//! Video decoding into raw RGB frames.
//!
//! [`GstVideoDecoder`] runs a GStreamer pipeline per video:
//!
//! ```text
//! filesrc -> decodebin -> videoconvert -> video/x-raw,format=RGB -> appsink
//! ```
//!
//! Decoding is blocking; callers drive a [`FrameSource`] from a blocking
//! thread, never from the async runtime.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while decoding a video
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("GStreamer initialization failed: {0}")]
    Init(String),

    #[error("Cannot open {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Decoding failed: {0}")]
    Stream(String),

    #[error("No frame decoded within {0:?}")]
    Stalled(Duration),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// One decoded frame, tightly packed RGB24
#[derive(Debug, Clone)]
pub struct RgbFrame {
    /// Position in the decoded stream, starting at 0
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Opens videos for decoding
pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError>;
}

/// Sequential frames of one open video
pub trait FrameSource: Send {
    /// Frame rate reported by the container, if any
    fn fps(&self) -> Option<f64>;

    /// Next frame in decode order; `None` at end of stream
    fn next_frame(&mut self) -> Result<Option<RgbFrame>, DecodeError>;
}

const PREROLL_TIMEOUT_SECS: u64 = 30;
const PULL_INTERVAL_MS: u64 = 100;
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// GStreamer-backed decoder for any container/codec the installed plugins
/// support
pub struct GstVideoDecoder {
    _private: (),
}

impl GstVideoDecoder {
    pub fn new() -> Result<Self, DecodeError> {
        gst::init().map_err(|e| DecodeError::Init(e.to_string()))?;
        Ok(Self { _private: () })
    }

    fn pipeline_description() -> &'static str {
        "filesrc name=src ! decodebin ! videoconvert \
         ! video/x-raw,format=RGB \
         ! appsink name=sink sync=false max-buffers=4"
    }
}

impl VideoDecoder for GstVideoDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        let open_error = |message: String| DecodeError::Open {
            path: path.to_path_buf(),
            message,
        };

        let location = path
            .to_str()
            .ok_or_else(|| open_error("path is not valid UTF-8".to_string()))?;

        let pipeline = gst::parse::launch(Self::pipeline_description())
            .map_err(|e| open_error(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_error("Failed to cast to Pipeline".to_string()))?;

        let src = pipeline
            .by_name("src")
            .ok_or_else(|| open_error("filesrc not found".to_string()))?;
        src.set_property("location", location);

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_error("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_error("Could not cast to AppSink".to_string()))?;

        let mut source = GstFrameSource {
            pipeline,
            appsink,
            fps: None,
            next_index: 0,
        };

        source
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_error(source.bus_error().unwrap_or_else(|| e.to_string())))?;

        // Prerolling negotiates caps, which carry the frame rate
        let (result, _state, _pending) = source
            .pipeline
            .state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
        if let Err(e) = result {
            return Err(open_error(source.bus_error().unwrap_or_else(|| e.to_string())));
        }

        source.fps = source.negotiated_fps();
        debug!(path = %path.display(), fps = ?source.fps, "Video opened");

        Ok(Box::new(source))
    }
}

struct GstFrameSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    fps: Option<f64>,
    next_index: u64,
}

impl GstFrameSource {
    fn negotiated_fps(&self) -> Option<f64> {
        let caps = self.appsink.static_pad("sink")?.current_caps()?;
        let info = gst_video::VideoInfo::from_caps(&caps).ok()?;
        let fps = info.fps();
        if fps.denom() == 0 {
            return None;
        }
        Some(fps.numer() as f64 / fps.denom() as f64)
    }

    /// First pending error on the pipeline bus
    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(match err.debug() {
                Some(debug) => format!("{} ({})", err.error(), debug),
                None => err.error().to_string(),
            }),
            _ => None,
        }
    }

    fn pull(&self) -> Result<Option<gst::Sample>, DecodeError> {
        let started = Instant::now();
        loop {
            if let Some(sample) = self
                .appsink
                .try_pull_sample(gst::ClockTime::from_mseconds(PULL_INTERVAL_MS))
            {
                return Ok(Some(sample));
            }
            if self.appsink.is_eos() {
                return Ok(None);
            }
            if let Some(message) = self.bus_error() {
                return Err(DecodeError::Stream(message));
            }
            if started.elapsed() >= STALL_TIMEOUT {
                return Err(DecodeError::Stalled(STALL_TIMEOUT));
            }
        }
    }
}

impl FrameSource for GstFrameSource {
    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn next_frame(&mut self) -> Result<Option<RgbFrame>, DecodeError> {
        let Some(sample) = self.pull()? else {
            return Ok(None);
        };

        let caps = sample
            .caps()
            .ok_or_else(|| DecodeError::InvalidFrame("sample without caps".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| DecodeError::InvalidFrame(e.to_string()))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| DecodeError::InvalidFrame("sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| DecodeError::InvalidFrame(e.to_string()))?;

        let data = pack_rows(
            map.as_slice(),
            info.width(),
            info.height(),
            info.stride()[0] as usize,
        )?;

        let frame = RgbFrame {
            index: self.next_index,
            width: info.width(),
            height: info.height(),
            data,
        };
        self.next_index += 1;
        Ok(Some(frame))
    }
}

impl Drop for GstFrameSource {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(error = %e, "Failed to stop decoding pipeline");
        }
    }
}

/// Copy padded rows into a tightly packed RGB24 buffer
fn pack_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Result<Vec<u8>, DecodeError> {
    let row_bytes = width as usize * 3;
    let height = height as usize;

    if stride < row_bytes || data.len() < stride * height.saturating_sub(1) + row_bytes {
        return Err(DecodeError::InvalidFrame(format!(
            "{} bytes cannot hold {}x{} with stride {}",
            data.len(),
            width,
            height,
            stride
        )));
    }

    if stride == row_bytes {
        return Ok(data[..row_bytes * height].to_vec());
    }

    let mut packed = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        packed.extend_from_slice(&data[start..start + row_bytes]);
    }
    Ok(packed)
}

/// Deterministic test-pattern video.
///
/// Opening any existing non-empty file yields `frame_count` frames at `fps`;
/// an empty file has no video stream and fails to open.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticVideo {
    pub fps: Option<f64>,
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
}

impl SyntheticVideo {
    pub fn new(fps: f64, frame_count: u64) -> Self {
        Self {
            fps: Some(fps),
            frame_count,
            width: 64,
            height: 48,
        }
    }

    /// Frame `index` of the pattern
    pub fn frame(&self, index: u64) -> RgbFrame {
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push((x as u64 + index) as u8);
                data.push((y as u64 + index) as u8);
                data.push((index * 7) as u8);
            }
        }
        RgbFrame {
            index,
            width: self.width,
            height: self.height,
            data,
        }
    }
}

impl VideoDecoder for SyntheticVideo {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        let metadata = std::fs::metadata(path).map_err(|e| DecodeError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if metadata.len() == 0 {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                message: "no video stream".to_string(),
            });
        }

        Ok(Box::new(SyntheticSource {
            video: *self,
            next_index: 0,
        }))
    }
}

struct SyntheticSource {
    video: SyntheticVideo,
    next_index: u64,
}

impl FrameSource for SyntheticSource {
    fn fps(&self) -> Option<f64> {
        self.video.fps
    }

    fn next_frame(&mut self) -> Result<Option<RgbFrame>, DecodeError> {
        if self.next_index >= self.video.frame_count {
            return Ok(None);
        }
        let frame = self.video.frame(self.next_index);
        self.next_index += 1;
        Ok(Some(frame))
    }
}
