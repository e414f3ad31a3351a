//! Append-only persistence of detection results.
//!
//! Duplicates for the same `(video_id, frame_index)` are expected after a
//! redelivery and are stored as-is.

use crate::config::DatabaseConfig;
use crate::task::DetectionResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to write result: {0}")]
    Write(String),
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Durably append one result
    async fn append(&self, result: &DetectionResult) -> Result<(), SinkError>;
}

/// Writes into the `detections` table; the schema is managed elsewhere
pub struct PgResultSink {
    pool: PgPool,
}

impl PgResultSink {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        info!("Connected to PostgreSQL result store");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultSink for PgResultSink {
    #[instrument(skip(self, result), fields(video_id = %result.video_id, frame_index = result.frame_index))]
    async fn append(&self, result: &DetectionResult) -> Result<(), SinkError> {
        let frame_index = i64::try_from(result.frame_index)
            .map_err(|_| SinkError::Write(format!("frame index {} out of range", result.frame_index)))?;

        sqlx::query(
            r#"
            INSERT INTO detections (video_id, frame_path, frame_index, timestamp, detections)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&result.video_id)
        .bind(&result.frame_path)
        .bind(frame_index)
        .bind(result.timestamp)
        .bind(Json(result.detections.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                SinkError::Unavailable(e.to_string())
            }
            other => SinkError::Write(other.to_string()),
        })?;

        debug!(detections = result.detections.len(), "Result stored");
        Ok(())
    }
}

/// Keeps results in memory. `set_unavailable(true)` makes appends fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryResultSink {
    results: Arc<Mutex<Vec<DetectionResult>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn results(&self) -> Vec<DetectionResult> {
        self.results.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn append(&self, result: &DetectionResult) -> Result<(), SinkError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("memory sink marked unavailable".to_string()));
        }
        self.results.lock().push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Detection, FrameTask};

    fn result(index: u64) -> DetectionResult {
        let task = FrameTask {
            video_id: "v".to_string(),
            frame_path: format!("frames/v/{}.jpg", index),
            frame_index: index,
            frame_hash: "h".to_string(),
            video_hash: "x".to_string(),
        };
        DetectionResult::for_frame(&task, vec![Detection::new("person", 0.9, [0.1, 0.1, 0.5, 0.5])])
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_duplicates() {
        let sink = MemoryResultSink::new();
        sink.append(&result(0)).await.unwrap();
        sink.append(&result(0)).await.unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(DetectionResult::dedupe_latest(sink.results()).len(), 1);
    }

    #[tokio::test]
    async fn test_memory_sink_unavailable() {
        let sink = MemoryResultSink::new();
        sink.set_unavailable(true);
        assert!(matches!(
            sink.append(&result(30)).await,
            Err(SinkError::Unavailable(_))
        ));
        assert!(sink.is_empty());
    }
}
