//! Ingest pipeline error types

use std::fmt;
use std::time::Duration;

/// Error type for pipeline operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Stream key is empty, too long or contains unsafe characters
    InvalidStreamKey(String),
    /// Transcoder process could not be started
    Spawn { program: String, reason: String },
    /// Pipeline is not accepting chunks (stopped, crashed or draining)
    NotActive,
    /// Transcoder did not accept input within the backpressure timeout
    Stalled(Duration),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidStreamKey(key) => write!(f, "Invalid stream key: {:?}", key),
            PipelineError::Spawn { program, reason } => {
                write!(f, "Failed to start transcoder {}: {}", program, reason)
            }
            PipelineError::NotActive => write!(f, "Pipeline is not active"),
            PipelineError::Stalled(timeout) => {
                write!(f, "Transcoder stalled for more than {:?}", timeout)
            }
        }
    }
}

impl std::error::Error for PipelineError {}
