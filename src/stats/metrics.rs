//! Statistics for the relay and its ingest pipelines

use std::time::Duration;

use crate::ingest::PipelineState;

/// Counters for one ingest pipeline
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// Pipeline ID
    pub pipeline_id: u64,
    /// Owning publisher
    pub identity: String,
    /// Stream key
    pub stream_key: String,
    /// Lifecycle state at snapshot time
    pub state: PipelineState,
    /// Bytes accepted from the publisher
    pub bytes_submitted: u64,
    /// Bytes written to the transcoder
    pub bytes_written: u64,
    /// Chunks written to the transcoder
    pub chunks_written: u64,
    /// Bytes accepted but not yet written
    pub pending_bytes: usize,
    /// Time since the transcoder started
    pub uptime: Duration,
}

impl PipelineStats {
    /// Average ingest rate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.uptime.as_secs();
        if secs > 0 {
            (self.bytes_written * 8) / secs
        } else {
            0
        }
    }
}

/// Server-wide statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Total connections ever accepted
    pub total_connections: u64,
    /// Currently open transport sessions
    pub active_sessions: u64,
    /// Registered publishers
    pub publishers: usize,
    /// Registered viewers
    pub viewers: usize,
    /// Registered peers
    pub peers: usize,
    /// Publishers with a running pipeline
    pub active_pipelines: usize,
    /// Uptime
    pub uptime: Duration,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered connections across all roles
    pub fn registered(&self) -> usize {
        self.publishers + self.viewers + self.peers
    }
}
