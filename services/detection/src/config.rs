//! Configuration for the detection stage.
//!
//! Loaded from `config/detection`, `/etc/frame-pipeline/detection` and
//! `DETECTION__*` environment variables.

use frame_pipeline::config::{
    load_layered_with_defaults, BrokerConfig, ConfigError, DatabaseConfig, ServiceConfig,
    StorageConfig, WorkerConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the detection service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    /// Consumes `broker.topics.frame_tasks`
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Result store
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Inference service and the worker pool calling it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Receives a JPEG body, answers with a JSON list of detections
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Dedicated inference threads; models are not assumed to be thread safe
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Requests waiting for a free inference thread
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_endpoint() -> String {
    "http://localhost:8000/detect".to_string()
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_pool_size() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    1
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl DetectionConfig {
    /// Load with the detection stage's defaults underneath every source
    pub fn load() -> Result<Self, ConfigError> {
        load_layered_with_defaults(
            "detection",
            "DETECTION",
            &[
                ("service.name", "frame-detection"),
                ("broker.consumer.group", "detection-group"),
            ],
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.storage.validate()?;

        if self.database.url.is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }

        let inference = &self.inference;
        if inference.endpoint.is_empty() {
            return Err(ConfigError::MissingRequired("inference.endpoint".to_string()));
        }
        if !inference.endpoint.starts_with("http://") && !inference.endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "inference.endpoint".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if inference.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "inference.pool_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if inference.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "inference.queue_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if inference.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "inference.timeout_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}
