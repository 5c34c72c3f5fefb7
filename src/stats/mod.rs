//! Relay and pipeline statistics

pub mod metrics;

pub use metrics::{PipelineStats, ServerStats};
