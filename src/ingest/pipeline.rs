//! Pipeline handle and supervisor task

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Notify};

use super::config::TranscoderConfig;
use super::error::PipelineError;
use super::flow::{FlowGate, PipelineState, Reservation, TerminationReason};
use super::transcoder;
use crate::stats::PipelineStats;

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// Result of offering a chunk to a pipeline
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Queued for the transcoder
    Accepted,
    /// Budget exhausted; the chunk is handed back and must be resubmitted
    /// after [`PipelineHandle::ready`] resolves
    Backpressured(Bytes),
}

/// Notification from a supervisor task
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The pipeline reached `Terminated` and its process was reaped
    Terminated {
        identity: String,
        pipeline_id: u64,
        reason: TerminationReason,
    },
}

#[derive(Debug)]
enum Command {
    Chunk(Bytes),
    Stop,
}

#[derive(Debug)]
struct Shared {
    id: u64,
    identity: String,
    stream_key: String,
    gate: FlowGate,
    kill: Notify,
    started_at: Instant,
    grace_period: Duration,
    backpressure_timeout: Duration,
}

/// Handle to one publisher's transcoder
///
/// Clones share the same pipeline. The connection registry holds the owning
/// copy; the router clones it briefly to submit chunks without holding the
/// registry lock. Dropping every clone stops the pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PipelineHandle {
    /// Spawn a transcoder for `identity` and start its supervisor
    ///
    /// The returned pipeline is `Active`. A spawn failure leaves nothing
    /// running and is reported to the caller only.
    pub async fn spawn(
        identity: &str,
        stream_key: &str,
        config: &TranscoderConfig,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<Self, PipelineError> {
        let id = NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed);
        let gate = FlowGate::new(config.max_pending_bytes);
        gate.set_state(PipelineState::Starting);

        let transcoder::Transcoder { child, stdin } =
            match transcoder::spawn(identity, stream_key, config).await {
                Ok(transcoder) => transcoder,
                Err(e) => {
                    gate.terminate(TerminationReason::Aborted);
                    tracing::warn!(
                        identity = %identity,
                        stream_key = %stream_key,
                        error = %e,
                        "Pipeline failed to start"
                    );
                    return Err(e);
                }
            };

        let shared = Arc::new(Shared {
            id,
            identity: identity.to_string(),
            stream_key: stream_key.to_string(),
            gate,
            kill: Notify::new(),
            started_at: Instant::now(),
            grace_period: config.grace_period,
            backpressure_timeout: config.backpressure_timeout,
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        shared.gate.set_state(PipelineState::Active);

        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            child,
            stdin: Some(stdin),
            commands: command_rx,
        };
        let guard = TerminationGuard {
            shared: Arc::clone(&shared),
            events,
            reported: false,
        };
        tokio::spawn(supervisor.run(guard));

        tracing::info!(
            identity = %identity,
            stream_key = %stream_key,
            pipeline_id = id,
            "Pipeline active"
        );

        Ok(Self { shared, commands })
    }

    /// Unique pipeline ID
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Owning publisher
    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    /// Stream key bound into the transcoder's output
    pub fn stream_key(&self) -> &str {
        &self.shared.stream_key
    }

    /// Current lifecycle state
    pub fn state(&self) -> PipelineState {
        self.shared.gate.state()
    }

    /// Offer a chunk without waiting
    ///
    /// Chunks are written in the order they are accepted. While the pipeline
    /// is `Active` a chunk is either accepted or handed back, never dropped.
    pub fn submit(&self, chunk: Bytes) -> Result<SubmitOutcome, PipelineError> {
        let len = chunk.len();

        match self.shared.gate.try_reserve(len) {
            Reservation::Accepted => {}
            Reservation::Saturated => return Ok(SubmitOutcome::Backpressured(chunk)),
            Reservation::Closed => return Err(PipelineError::NotActive),
        }

        if len == 0 {
            return Ok(SubmitOutcome::Accepted);
        }

        if self.commands.send(Command::Chunk(chunk)).is_err() {
            self.shared.gate.cancel(len);
            return Err(PipelineError::NotActive);
        }

        tracing::trace!(
            identity = %self.shared.identity,
            bytes = len,
            "Chunk queued"
        );

        Ok(SubmitOutcome::Accepted)
    }

    /// Wait until a chunk of `len` bytes would be accepted, or the pipeline
    /// stops accepting chunks
    pub async fn ready(&self, len: usize) {
        self.shared.gate.ready(len).await
    }

    /// Submit a chunk, waiting out backpressure
    ///
    /// Fails with [`PipelineError::Stalled`] if the transcoder accepts no
    /// input for the configured backpressure timeout.
    pub async fn submit_with_backpressure(&self, chunk: Bytes) -> Result<(), PipelineError> {
        let mut chunk = chunk;
        loop {
            match self.submit(chunk)? {
                SubmitOutcome::Accepted => return Ok(()),
                SubmitOutcome::Backpressured(held) => {
                    let timeout = self.shared.backpressure_timeout;
                    if tokio::time::timeout(timeout, self.ready(held.len()))
                        .await
                        .is_err()
                    {
                        return Err(PipelineError::Stalled(timeout));
                    }
                    chunk = held;
                }
            }
        }
    }

    /// Stop the pipeline and wait until its process is reaped
    ///
    /// Chunks accepted before the call are written first, then input is
    /// closed. The grace period counts from this call and covers both the
    /// flush and the process exit; a transcoder still running when it runs
    /// out is killed, even if it stopped reading mid-chunk.
    pub async fn stop(&self) -> TerminationReason {
        if self.state() != PipelineState::Terminated {
            let _ = self.commands.send(Command::Stop);
        }

        let grace = self.shared.grace_period;
        match tokio::time::timeout(grace, self.terminated()).await {
            Ok(reason) => reason,
            Err(_) => {
                tracing::warn!(
                    identity = %self.shared.identity,
                    pipeline_id = self.shared.id,
                    "Pipeline did not drain in time, killing transcoder"
                );
                self.shared.kill.notify_one();
                self.terminated().await
            }
        }
    }

    /// Wait for `Terminated`
    pub async fn terminated(&self) -> TerminationReason {
        self.shared.gate.terminated().await
    }

    /// Current counters
    pub fn stats(&self) -> PipelineStats {
        let flow = self.shared.gate.snapshot();
        PipelineStats {
            pipeline_id: self.shared.id,
            identity: self.shared.identity.clone(),
            stream_key: self.shared.stream_key.clone(),
            state: flow.state,
            bytes_submitted: flow.bytes_submitted,
            bytes_written: flow.bytes_written,
            chunks_written: flow.chunks_written,
            pending_bytes: flow.pending_bytes,
            uptime: self.shared.started_at.elapsed(),
        }
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("id", &self.shared.id)
            .field("identity", &self.shared.identity)
            .field("stream_key", &self.shared.stream_key)
            .field("state", &self.state())
            .finish()
    }
}

/// Publishes the final state exactly once, even if the supervisor panics
struct TerminationGuard {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    reported: bool,
}

impl TerminationGuard {
    fn finish(mut self, reason: TerminationReason) {
        self.report(reason);
    }

    fn report(&mut self, reason: TerminationReason) {
        if self.reported {
            return;
        }
        self.reported = true;

        self.shared.gate.terminate(reason.clone());
        let _ = self.events.send(PipelineEvent::Terminated {
            identity: self.shared.identity.clone(),
            pipeline_id: self.shared.id,
            reason,
        });
    }
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        self.report(TerminationReason::Aborted);
    }
}

enum Next {
    Kill,
    Exited(std::io::Result<std::process::ExitStatus>),
    Command(Option<Command>),
}

enum WriteOutcome {
    Written(std::io::Result<()>),
    Exited(std::io::Result<std::process::ExitStatus>),
    Killed,
}

fn exit_reason(status: std::io::Result<std::process::ExitStatus>) -> TerminationReason {
    TerminationReason::Exited {
        code: status.ok().and_then(|s| s.code()),
    }
}

/// Owns the process; the only writer of its stdin
struct Supervisor {
    shared: Arc<Shared>,
    child: Child,
    stdin: Option<ChildStdin>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Supervisor {
    async fn run(mut self, guard: TerminationGuard) {
        let reason = self.pump().await;
        let stats = self.shared.gate.snapshot();

        if reason.is_unexpected() {
            tracing::warn!(
                identity = %self.shared.identity,
                pipeline_id = self.shared.id,
                reason = %reason,
                bytes_written = stats.bytes_written,
                "Pipeline terminated unexpectedly"
            );
        } else {
            tracing::info!(
                identity = %self.shared.identity,
                pipeline_id = self.shared.id,
                reason = %reason,
                bytes_written = stats.bytes_written,
                "Pipeline terminated"
            );
        }

        guard.finish(reason);
    }

    async fn pump(&mut self) -> TerminationReason {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.kill.notified() => Next::Kill,
                status = self.child.wait() => Next::Exited(status),
                command = self.commands.recv() => Next::Command(command),
            };

            match next {
                Next::Kill => return self.kill().await,
                Next::Exited(status) => return exit_reason(status),
                Next::Command(Some(Command::Chunk(chunk))) => {
                    if let Err(reason) = self.write(chunk).await {
                        return reason;
                    }
                }
                Next::Command(Some(Command::Stop)) | Next::Command(None) => {
                    return self.drain().await;
                }
            }
        }
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), TerminationReason> {
        let len = chunk.len();
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(TerminationReason::WriteFailed("input closed".to_string()));
        };

        let outcome = tokio::select! {
            biased;
            _ = self.shared.kill.notified() => WriteOutcome::Killed,
            status = self.child.wait() => WriteOutcome::Exited(status),
            result = stdin.write_all(&chunk) => WriteOutcome::Written(result),
        };

        match outcome {
            WriteOutcome::Written(Ok(())) => {
                self.shared.gate.complete(len);
                tracing::trace!(
                    identity = %self.shared.identity,
                    bytes = len,
                    "Chunk written"
                );
                Ok(())
            }
            WriteOutcome::Written(Err(e)) => {
                self.kill().await;
                Err(TerminationReason::WriteFailed(e.to_string()))
            }
            WriteOutcome::Exited(status) => Err(exit_reason(status)),
            WriteOutcome::Killed => Err(self.kill().await),
        }
    }

    /// Close input and give the process the grace period to exit
    async fn drain(&mut self) -> TerminationReason {
        self.shared.gate.set_state(PipelineState::Draining);
        drop(self.stdin.take());

        let grace = self.shared.grace_period;
        let waited = tokio::select! {
            biased;
            _ = self.shared.kill.notified() => None,
            result = tokio::time::timeout(grace, self.child.wait()) => Some(result),
        };

        match waited {
            Some(Ok(Ok(status))) => TerminationReason::Stopped {
                code: status.code(),
            },
            Some(Ok(Err(e))) => {
                tracing::warn!(
                    identity = %self.shared.identity,
                    error = %e,
                    "Failed to wait for transcoder"
                );
                self.kill().await
            }
            Some(Err(_)) => {
                tracing::warn!(
                    identity = %self.shared.identity,
                    grace_ms = grace.as_millis() as u64,
                    "Transcoder ignored end of input, killing"
                );
                self.kill().await
            }
            None => self.kill().await,
        }
    }

    async fn kill(&mut self) -> TerminationReason {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill().await {
            tracing::debug!(
                identity = %self.shared.identity,
                error = %e,
                "Kill failed, reaping"
            );
            let _ = self.child.wait().await;
        }
        TerminationReason::Killed
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn cat_config(root: &Path) -> TranscoderConfig {
        TranscoderConfig::default()
            .program("sh")
            .args(["-c", "cat > {output_dir}/input.bin"])
            .output_root(root)
            .grace_period(Duration::from_secs(5))
    }

    async fn spawn_with(
        config: &TranscoderConfig,
    ) -> (PipelineHandle, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let handle = PipelineHandle::spawn("alice", "alice", config, events)
            .await
            .unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_chunks_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events) = spawn_with(&cat_config(dir.path())).await;
        assert_eq!(handle.state(), PipelineState::Active);
        assert_eq!(handle.stream_key(), "alice");

        let chunks = [vec![1u8; 100], vec![2u8; 200], vec![3u8; 50]];
        for chunk in &chunks {
            handle
                .submit_with_backpressure(Bytes::from(chunk.clone()))
                .await
                .unwrap();
        }

        let reason = handle.stop().await;
        assert_eq!(reason, TerminationReason::Stopped { code: Some(0) });
        assert_eq!(handle.state(), PipelineState::Terminated);

        let written = std::fs::read(dir.path().join("alice/input.bin")).unwrap();
        assert_eq!(written, chunks.concat());

        let stats = handle.stats();
        assert_eq!(stats.bytes_submitted, 350);
        assert_eq!(stats.bytes_written, 350);
        assert_eq!(stats.chunks_written, 3);
        assert_eq!(stats.pending_bytes, 0);

        match events.recv().await.unwrap() {
            PipelineEvent::Terminated {
                identity,
                pipeline_id,
                reason,
            } => {
                assert_eq!(identity, "alice");
                assert_eq!(pipeline_id, handle.id());
                assert!(!reason.is_unexpected());
            }
        }
    }

    #[tokio::test]
    async fn test_backpressure_never_loses_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let config = TranscoderConfig::default()
            .program("sh")
            .args(["-c", "sleep 0.3; cat > {output_dir}/input.bin"])
            .output_root(dir.path())
            .max_pending_bytes(4096);
        let (handle, _events) = spawn_with(&config).await;

        let mut expected = Vec::new();
        for i in 0..256u32 {
            let chunk = Bytes::from(vec![(i % 251) as u8; 1024]);
            expected.extend_from_slice(&chunk);

            let mut pending = chunk;
            loop {
                match handle.submit(pending).unwrap() {
                    SubmitOutcome::Accepted => break,
                    SubmitOutcome::Backpressured(held) => {
                        handle.ready(held.len()).await;
                        pending = held;
                    }
                }
            }
        }

        handle.stop().await;

        let written = std::fs::read(dir.path().join("alice/input.bin")).unwrap();
        assert_eq!(written.len(), expected.len());
        assert_eq!(written, expected);

        let stats = handle.stats();
        assert_eq!(stats.bytes_written, stats.bytes_submitted);
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, _events) = spawn_with(&cat_config(dir.path())).await;

        handle.stop().await;

        let result = handle.submit(Bytes::from_static(b"late"));
        assert!(matches!(result, Err(PipelineError::NotActive)));
        assert_eq!(handle.stats().bytes_submitted, 0);
    }

    #[tokio::test]
    async fn test_unexpected_exit_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = cat_config(dir.path()).args(["-c", "exit 3"]);
        let (handle, mut events) = spawn_with(&config).await;

        let PipelineEvent::Terminated { reason, .. } = events.recv().await.unwrap();
        assert_eq!(reason, TerminationReason::Exited { code: Some(3) });
        assert!(reason.is_unexpected());

        assert_eq!(handle.state(), PipelineState::Terminated);
        assert!(matches!(
            handle.submit(Bytes::from_static(b"x")),
            Err(PipelineError::NotActive)
        ));

        // Stopping a dead pipeline reports how it ended
        assert_eq!(handle.stop().await, reason);
    }

    #[tokio::test]
    async fn test_killed_after_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let config = cat_config(dir.path())
            .args(["-c", "exec sleep 30"])
            .grace_period(Duration::from_millis(200));
        let (handle, _events) = spawn_with(&config).await;

        let started = Instant::now();
        let reason = handle.stop().await;

        assert_eq!(reason, TerminationReason::Killed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.state(), PipelineState::Terminated);
    }

    #[tokio::test]
    async fn test_stop_kills_blocked_writer_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let config = cat_config(dir.path())
            .args(["-c", "exec sleep 30"])
            .max_pending_bytes(1024)
            .grace_period(Duration::from_millis(500));
        let (handle, _events) = spawn_with(&config).await;

        // Larger than the pipe buffer, so the supervisor blocks mid-write
        let chunk = Bytes::from(vec![7u8; 256 * 1024]);
        assert!(matches!(handle.submit(chunk), Ok(SubmitOutcome::Accepted)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let reason = handle.stop().await;

        assert_eq!(reason, TerminationReason::Killed);
        assert!(started.elapsed() < Duration::from_millis(900));
        assert!(handle.stats().bytes_written < 256 * 1024);
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, mut events) = spawn_with(&cat_config(dir.path())).await;
        let id = handle.id();

        drop(handle);

        let PipelineEvent::Terminated {
            pipeline_id,
            reason,
            ..
        } = events.recv().await.unwrap();
        assert_eq!(pipeline_id, id);
        assert_eq!(reason, TerminationReason::Stopped { code: Some(0) });
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = cat_config(dir.path()).program("/nonexistent/transcoder");
        let (events, _rx) = mpsc::unbounded_channel();

        let result = PipelineHandle::spawn("alice", "alice", &config, events).await;
        assert!(matches!(result, Err(PipelineError::Spawn { .. })));

        let (events, _rx) = mpsc::unbounded_channel();
        let result = PipelineHandle::spawn("alice", "../escape", &config, events).await;
        assert!(matches!(result, Err(PipelineError::InvalidStreamKey(_))));
    }
}
