//! Failure taxonomy shared by every stage.
//!
//! The consumer loop only looks at [`PipelineError::is_terminal`]: terminal
//! errors are acknowledged and dropped, everything else leaves the delivery
//! redeliverable.

use crate::broker::BrokerError;
use crate::sink::SinkError;
use crate::storage::StorageError;
use crate::task::TaskError;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("broker unavailable: {0}")]
    TransientBroker(#[from] BrokerError),

    #[error("storage unavailable: {0}")]
    TransientStorage(String),

    #[error("inference failed: {0}")]
    TransientInference(String),

    #[error("frame {frame_path} is corrupted: expected digest {expected}, actual {actual}")]
    Corruption {
        frame_path: String,
        expected: String,
        actual: String,
    },

    #[error("source payload missing: {0}")]
    MissingSource(String),

    #[error("malformed task: {0}")]
    MalformedTask(String),

    #[error("source cannot be decoded: {0}")]
    UndecodableSource(String),
}

impl PipelineError {
    /// Terminal errors will not go away by redelivering the same task
    pub fn is_terminal(&self) -> bool {
        self.drop_reason().is_some()
    }

    /// Why a terminal error drops its task; `None` for transient errors
    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            PipelineError::Corruption { .. } => Some(DropReason::Corrupted),
            PipelineError::MissingSource(_) => Some(DropReason::MissingSource),
            PipelineError::MalformedTask(_) => Some(DropReason::Malformed),
            PipelineError::UndecodableSource(_) => Some(DropReason::UndecodableSource),
            PipelineError::TransientBroker(_)
            | PipelineError::TransientStorage(_)
            | PipelineError::TransientInference(_) => None,
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(reference) => PipelineError::MissingSource(reference),
            StorageError::InvalidReference(reference) => {
                PipelineError::MalformedTask(format!("invalid storage reference {}", reference))
            }
            other => PipelineError::TransientStorage(other.to_string()),
        }
    }
}

/// Result persistence failures are always retried through redelivery
impl From<SinkError> for PipelineError {
    fn from(err: SinkError) -> Self {
        PipelineError::TransientStorage(err.to_string())
    }
}

impl From<TaskError> for PipelineError {
    fn from(err: TaskError) -> Self {
        PipelineError::MalformedTask(err.to_string())
    }
}

/// How a delivery left the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed and acknowledged
    Acknowledged,
    /// Acknowledged without producing output
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Corrupted,
    MissingSource,
    UndecodableSource,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Corrupted => "corrupted",
            DropReason::MissingSource => "missing_source",
            DropReason::UndecodableSource => "undecodable_source",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert!(!PipelineError::TransientStorage("db down".into()).is_terminal());
        assert!(!PipelineError::from(BrokerError::NotConnected).is_terminal());
        assert!(PipelineError::MissingSource("videos/a.mp4".into()).is_terminal());
        assert_eq!(
            PipelineError::Corruption {
                frame_path: "f".into(),
                expected: "deadbeef".into(),
                actual: "cafef00d".into(),
            }
            .drop_reason(),
            Some(DropReason::Corrupted)
        );
    }

    #[test]
    fn test_storage_not_found_is_missing_source() {
        let err: PipelineError = StorageError::NotFound("frames/v/0.jpg".into()).into();
        assert!(matches!(err, PipelineError::MissingSource(_)));

        let err: PipelineError = StorageError::Backend("timeout".into()).into();
        assert!(matches!(err, PipelineError::TransientStorage(_)));
    }

    #[test]
    fn test_sink_and_inference_failures_are_transient() {
        let err: PipelineError = SinkError::Unavailable("connection refused".into()).into();
        assert!(!err.is_terminal());
        assert!(!PipelineError::TransientInference("timeout".into()).is_terminal());
    }

    #[test]
    fn test_task_error_is_malformed() {
        let err: PipelineError = TaskError::MissingField("video_id").into();
        assert_eq!(err.drop_reason(), Some(DropReason::Malformed));
    }
}
