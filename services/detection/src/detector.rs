//! Detection collaborator.
//!
//! A [`Detector`] is synchronous and may be slow; it is only ever called from
//! an [`crate::inference_pool::InferencePool`] thread.

use crate::config::InferenceConfig;
use frame_pipeline::Detection;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Inference request failed: {0}")]
    Request(String),

    #[error("Inference service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid inference response: {0}")]
    InvalidResponse(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Inference pool unavailable: {0}")]
    Unavailable(String),
}

/// Finds objects in one encoded image
#[cfg_attr(test, mockall::automock)]
pub trait Detector: Send + Sync {
    /// Bounding boxes are normalized `[x1, y1, x2, y2]`
    fn infer(&self, image: &[u8]) -> Result<Vec<Detection>, DetectorError>;
}

/// Accepted response bodies: a bare list or `{"detections": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Bare(Vec<Detection>),
    Wrapped { detections: Vec<Detection> },
}

impl InferenceResponse {
    fn into_detections(self) -> Vec<Detection> {
        match self {
            InferenceResponse::Bare(detections) => detections,
            InferenceResponse::Wrapped { detections } => detections,
        }
    }
}

/// Parse an inference service response body
pub fn parse_response(body: &[u8]) -> Result<Vec<Detection>, DetectorError> {
    let response: InferenceResponse =
        serde_json::from_slice(body).map_err(|e| DetectorError::InvalidResponse(e.to_string()))?;
    Ok(response
        .into_detections()
        .into_iter()
        .map(Detection::normalized)
        .collect())
}

/// Posts JPEG bytes to an HTTP inference service
pub struct HttpDetector {
    endpoint: String,
    timeout: Duration,
    connect_timeout: Duration,
    /// Built on first use, on an inference thread; a blocking client must not
    /// be created inside the async runtime
    client: OnceLock<Client>,
}

impl HttpDetector {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            timeout: config.timeout(),
            connect_timeout: config.connect_timeout(),
            client: OnceLock::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn client(&self) -> Result<&Client, DetectorError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| DetectorError::Request(format!("Failed to build HTTP client: {}", e)))?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl Detector for HttpDetector {
    fn infer(&self, image: &[u8]) -> Result<Vec<Detection>, DetectorError> {
        let response = self
            .client()?
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(image.to_vec())
            .send()
            .map_err(|e| DetectorError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .map_err(|e| DetectorError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(DetectorError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).chars().take(512).collect(),
            });
        }

        let detections = parse_response(&body)?;
        debug!(count = detections.len(), size_bytes = image.len(), "Inference complete");
        Ok(detections)
    }
}
