//! Transcoder process launch

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};

use super::config::TranscoderConfig;
use super::error::PipelineError;

/// Longest accepted stream key
pub const MAX_STREAM_KEY_LEN: usize = 64;

/// Check that a stream key is safe to use as a directory name and URL segment
pub fn validate_stream_key(key: &str) -> Result<(), PipelineError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_STREAM_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidStreamKey(key.to_string()))
    }
}

/// A running transcoder with its input detached
///
/// `stdin` is taken out of the child so that waiting on the child never
/// closes it implicitly.
pub(crate) struct Transcoder {
    pub child: Child,
    pub stdin: ChildStdin,
}

/// Spawn the transcoder for one stream
pub(crate) async fn spawn(
    identity: &str,
    stream_key: &str,
    config: &TranscoderConfig,
) -> Result<Transcoder, PipelineError> {
    validate_stream_key(stream_key)?;

    let spawn_error = |reason: String| PipelineError::Spawn {
        program: config.program.clone(),
        reason,
    };

    let output_dir = config.output_dir(stream_key);
    tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
        spawn_error(format!(
            "cannot create output directory {}: {}",
            output_dir.display(),
            e
        ))
    })?;

    let args = config.render_args(stream_key, &output_dir);
    let stderr = if config.capture_stderr {
        Stdio::piped()
    } else {
        Stdio::null()
    };

    let mut child = Command::new(&config.program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(e.to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error("stdin was not captured".to_string()))?;

    if let Some(stderr) = child.stderr.take() {
        forward_stderr(identity.to_string(), stderr);
    }

    tracing::debug!(
        identity = %identity,
        program = %config.program,
        args = ?args,
        pid = ?child.id(),
        "Transcoder spawned"
    );

    Ok(Transcoder { child, stdin })
}

/// Re-emit transcoder diagnostics line by line until the pipe closes
fn forward_stderr(identity: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "transcoder", identity = %identity, "{}", line);
        }
    });
}
