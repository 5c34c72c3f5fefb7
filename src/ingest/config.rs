//! Transcoder configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Replaced by the publisher's stream key in `args`
pub const STREAM_KEY_PLACEHOLDER: &str = "{stream_key}";

/// Replaced by the per-stream output directory in `args`
pub const OUTPUT_DIR_PLACEHOLDER: &str = "{output_dir}";

/// How transcoder processes are launched and fed
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Executable to run
    pub program: String,

    /// Argument template; see the placeholder constants
    pub args: Vec<String>,

    /// Parent of the per-stream output directories
    pub output_root: PathBuf,

    /// How long a stopping transcoder may take to flush queued chunks and
    /// exit before it is killed
    pub grace_period: Duration,

    /// Bytes that may be queued ahead of the transcoder before submitters
    /// are backpressured
    pub max_pending_bytes: usize,

    /// How long a backpressured chunk may wait before the pipeline is
    /// considered stalled
    pub backpressure_timeout: Duration,

    /// Re-emit transcoder stderr through tracing
    pub capture_stderr: bool,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        // Browser MediaRecorder WebM in, HLS out: 2s segments, 3-entry
        // playlist, old segments deleted.
        let args = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-i",
            "-",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-c:a",
            "aac",
            "-f",
            "hls",
            "-hls_time",
            "2",
            "-hls_list_size",
            "3",
            "-hls_flags",
            "delete_segments",
            "{output_dir}/index.m3u8",
        ];

        Self {
            program: "ffmpeg".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            output_root: PathBuf::from("media/live"),
            grace_period: Duration::from_secs(5),
            max_pending_bytes: 4 * 1024 * 1024, // 4MB
            backpressure_timeout: Duration::from_secs(10),
            capture_stderr: true,
        }
    }
}

impl TranscoderConfig {
    /// Set the executable
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Replace the argument template
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the output root
    pub fn output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    /// Set the stop grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the pending byte budget
    pub fn max_pending_bytes(mut self, max: usize) -> Self {
        self.max_pending_bytes = max.max(1);
        self
    }

    /// Set the backpressure timeout
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    /// Enable or disable stderr capture
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Output directory for a stream key
    pub fn output_dir(&self, stream_key: &str) -> PathBuf {
        self.output_root.join(stream_key)
    }

    /// Arguments with placeholders substituted
    pub fn render_args(&self, stream_key: &str, output_dir: &Path) -> Vec<String> {
        let output_dir = output_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(STREAM_KEY_PLACEHOLDER, stream_key)
                    .replace(OUTPUT_DIR_PLACEHOLDER, &output_dir)
            })
            .collect()
    }
}
