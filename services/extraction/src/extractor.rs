//! Frame sampling and JPEG encoding.

use crate::decoder::{DecodeError, FrameSource, RgbFrame};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Failed to encode frame {index}: {message}")]
    Encode { index: u64, message: String },
}

/// Frames between two samples: `round(fps * period)`, at least 1.
///
/// A missing, non-finite or non-positive `fps` falls back to `default_fps`.
pub fn sampling_interval(fps: Option<f64>, period: Duration, default_fps: f64) -> u64 {
    let fps = fps
        .filter(|fps| fps.is_finite() && *fps > 0.0)
        .unwrap_or(default_fps);
    let interval = (fps * period.as_secs_f64()).round();
    if interval >= 1.0 {
        interval as u64
    } else {
        1
    }
}

/// An encoded sampled frame
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub index: u64,
    pub bytes: Vec<u8>,
}

/// Encodes RGB frames as baseline JPEG
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn encode(&self, frame: RgbFrame) -> Result<EncodedFrame, ExtractError> {
        let index = frame.index;
        let image = RgbImage::from_raw(frame.width, frame.height, frame.data).ok_or_else(|| {
            ExtractError::Encode {
                index,
                message: format!("buffer too small for {}x{}", frame.width, frame.height),
            }
        })?;

        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.quality)
            .encode_image(&image)
            .map_err(|e| ExtractError::Encode {
                index,
                message: e.to_string(),
            })?;

        Ok(EncodedFrame { index, bytes })
    }
}

/// Counts from one [`FrameSampler::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    pub decoded: u64,
    pub sampled: u64,
    /// The consumer stopped accepting frames before end of stream
    pub interrupted: bool,
}

/// Walks a source and encodes every frame whose index is a multiple of the
/// interval
#[derive(Debug, Clone, Copy)]
pub struct FrameSampler {
    interval: u64,
    encoder: FrameEncoder,
}

impl FrameSampler {
    pub fn new(interval: u64, encoder: FrameEncoder) -> Self {
        Self {
            interval: interval.max(1),
            encoder,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Decode to end of stream, handing each sampled frame to `emit` in index
    /// order. Stops early when `emit` returns `false`.
    pub fn run<F>(&self, source: &mut dyn FrameSource, mut emit: F) -> Result<SampleStats, ExtractError>
    where
        F: FnMut(EncodedFrame) -> bool,
    {
        let mut stats = SampleStats::default();

        while let Some(frame) = source.next_frame()? {
            stats.decoded += 1;
            if frame.index % self.interval != 0 {
                continue;
            }

            let encoded = self.encoder.encode(frame)?;
            stats.sampled += 1;
            debug!(frame_index = encoded.index, size_bytes = encoded.bytes.len(), "Frame sampled");

            if !emit(encoded) {
                stats.interrupted = true;
                break;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{SyntheticVideo, VideoDecoder};
    use std::io::Write;

    fn open(video: SyntheticVideo) -> (tempfile::NamedTempFile, Box<dyn FrameSource>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"video").unwrap();
        let source = video.open(file.path()).unwrap();
        (file, source)
    }

    #[test]
    fn test_interval_rounds_frame_rate() {
        let second = Duration::from_secs(1);
        assert_eq!(sampling_interval(Some(30.0), second, 30.0), 30);
        assert_eq!(sampling_interval(Some(29.97), second, 30.0), 30);
        assert_eq!(sampling_interval(Some(24.0), Duration::from_millis(500), 30.0), 12);
    }

    #[test]
    fn test_interval_falls_back_to_default_fps() {
        let second = Duration::from_secs(1);
        assert_eq!(sampling_interval(None, second, 25.0), 25);
        assert_eq!(sampling_interval(Some(0.0), second, 25.0), 25);
        assert_eq!(sampling_interval(Some(-1.0), second, 25.0), 25);
        assert_eq!(sampling_interval(Some(f64::NAN), second, 25.0), 25);
    }

    #[test]
    fn test_interval_is_at_least_one() {
        assert_eq!(sampling_interval(Some(1.0), Duration::from_millis(100), 30.0), 1);
    }

    #[test]
    fn test_encoder_produces_jpeg() {
        let frame = SyntheticVideo::new(30.0, 1).frame(0);
        let encoded = FrameEncoder::new(85).encode(frame).unwrap();
        assert_eq!(&encoded.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_encoder_is_deterministic() {
        let video = SyntheticVideo::new(30.0, 1);
        let encoder = FrameEncoder::new(90);
        let first = encoder.encode(video.frame(3)).unwrap();
        let second = encoder.encode(video.frame(3)).unwrap();
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn test_encoder_rejects_short_buffer() {
        let frame = RgbFrame {
            index: 7,
            width: 4,
            height: 4,
            data: vec![0; 10],
        };
        assert!(matches!(
            FrameEncoder::new(90).encode(frame),
            Err(ExtractError::Encode { index: 7, .. })
        ));
    }

    #[test]
    fn test_sampler_emits_multiples_of_interval() {
        let (_file, mut source) = open(SyntheticVideo::new(30.0, 90));
        let sampler = FrameSampler::new(30, FrameEncoder::new(80));

        let mut indices = Vec::new();
        let stats = sampler
            .run(source.as_mut(), |frame| {
                indices.push(frame.index);
                true
            })
            .unwrap();

        assert_eq!(indices, vec![0, 30, 60]);
        assert_eq!(stats.decoded, 90);
        assert_eq!(stats.sampled, 3);
        assert!(!stats.interrupted);
    }

    #[test]
    fn test_sampler_includes_last_partial_interval() {
        let (_file, mut source) = open(SyntheticVideo::new(10.0, 21));
        let sampler = FrameSampler::new(10, FrameEncoder::new(80));

        let mut indices = Vec::new();
        sampler
            .run(source.as_mut(), |frame| {
                indices.push(frame.index);
                true
            })
            .unwrap();
        assert_eq!(indices, vec![0, 10, 20]);
    }

    #[test]
    fn test_sampler_stops_when_consumer_goes_away() {
        let (_file, mut source) = open(SyntheticVideo::new(30.0, 90));
        let sampler = FrameSampler::new(30, FrameEncoder::new(80));

        let stats = sampler.run(source.as_mut(), |_| false).unwrap();
        assert_eq!(stats.sampled, 1);
        assert!(stats.interrupted);
    }
}
