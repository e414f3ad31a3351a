//! Configuration for the extraction stage.
//!
//! Loaded from `config/extraction`, `/etc/frame-pipeline/extraction` and
//! `EXTRACTION__*` environment variables.

use frame_pipeline::config::{
    load_layered_with_defaults, BrokerConfig, ConfigError, ServiceConfig, StorageConfig,
    WorkerConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the extraction service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    /// Consumes `broker.topics.video_tasks`, produces `broker.topics.frame_tasks`
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub extraction: ExtractionSettings,
}

/// Frame sampling and encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    /// Keep one frame every this many seconds of video
    #[serde(default = "default_sample_period_secs")]
    pub sample_period_secs: f64,

    /// Assumed frame rate when the container does not report a usable one
    #[serde(default = "default_fps")]
    pub default_fps: f64,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Encoded frames buffered between the decoder thread and the publisher
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_sample_period_secs() -> f64 {
    1.0
}

fn default_fps() -> f64 {
    30.0
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_channel_capacity() -> usize {
    8
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            sample_period_secs: default_sample_period_secs(),
            default_fps: default_fps(),
            jpeg_quality: default_jpeg_quality(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ExtractionSettings {
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(self.sample_period_secs)
    }
}

impl ExtractionConfig {
    /// Load with the extraction stage's defaults underneath every source
    pub fn load() -> Result<Self, ConfigError> {
        load_layered_with_defaults(
            "extraction",
            "EXTRACTION",
            &[
                ("service.name", "frame-extraction"),
                ("broker.consumer.group", "processing-group"),
            ],
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.storage.validate()?;

        let settings = &self.extraction;
        if !(settings.sample_period_secs.is_finite() && settings.sample_period_secs > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "extraction.sample_period_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if !(settings.default_fps.is_finite() && settings.default_fps > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "extraction.default_fps".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if settings.jpeg_quality == 0 || settings.jpeg_quality > 100 {
            return Err(ConfigError::InvalidValue {
                key: "extraction.jpeg_quality".to_string(),
                message: "must be between 1 and 100".to_string(),
            });
        }

        if settings.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "extraction.channel_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExtractionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.extraction.sample_period(), Duration::from_secs(1));
        assert_eq!(config.broker.topics.video_tasks, "video-uploads");
    }

    #[test]
    fn test_zero_sample_period_rejected() {
        let mut config = ExtractionConfig::default();
        config.extraction.sample_period_secs = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_jpeg_quality_bounds() {
        let mut config = ExtractionConfig::default();
        config.extraction.jpeg_quality = 101;
        assert!(config.validate().is_err());
        config.extraction.jpeg_quality = 1;
        assert!(config.validate().is_ok());
    }
}
