//! Pipeline state and flow control
//!
//! A single `watch` channel carries the pipeline state together with the byte
//! counters, so submitters waiting for room are woken both when the
//! transcoder drains input and when the pipeline leaves `Active`.

use std::fmt;

use tokio::sync::watch;

/// Lifecycle state of an ingest pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, no process yet
    Idle,
    /// Process being spawned
    Starting,
    /// Accepting chunks
    Active,
    /// Input closed, waiting for the process to exit
    Draining,
    /// Process reaped (final)
    Terminated,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Active => "active",
            PipelineState::Draining => "draining",
            PipelineState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a pipeline reached `Terminated`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Stopped on request and exited within the grace period
    Stopped { code: Option<i32> },
    /// Force-killed after the grace period or on request
    Killed,
    /// Process exited on its own while active
    Exited { code: Option<i32> },
    /// Writing to the process input failed
    WriteFailed(String),
    /// Supervisor ended without reporting (panic)
    Aborted,
}

impl TerminationReason {
    /// Whether the publisher did not ask for this termination
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            TerminationReason::Exited { .. }
                | TerminationReason::WriteFailed(_)
                | TerminationReason::Aborted
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Stopped { code: Some(code) } => {
                write!(f, "stopped (exit code {})", code)
            }
            TerminationReason::Stopped { code: None } => write!(f, "stopped"),
            TerminationReason::Killed => write!(f, "killed"),
            TerminationReason::Exited { code: Some(code) } => {
                write!(f, "transcoder exited with code {}", code)
            }
            TerminationReason::Exited { code: None } => write!(f, "transcoder terminated by signal"),
            TerminationReason::WriteFailed(reason) => {
                write!(f, "writing to transcoder failed: {}", reason)
            }
            TerminationReason::Aborted => write!(f, "pipeline supervisor aborted"),
        }
    }
}

/// Snapshot of a pipeline's state and counters
#[derive(Debug, Clone)]
pub(crate) struct Flow {
    pub state: PipelineState,
    /// Bytes accepted but not yet written to the process
    pub pending_bytes: usize,
    pub bytes_submitted: u64,
    pub bytes_written: u64,
    pub chunks_written: u64,
    pub reason: Option<TerminationReason>,
}

/// Result of trying to reserve room for a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reservation {
    Accepted,
    Saturated,
    Closed,
}

/// Byte budget between submitters and the supervisor
#[derive(Debug)]
pub(crate) struct FlowGate {
    tx: watch::Sender<Flow>,
    max_pending_bytes: usize,
}

/// A chunk fits if nothing is pending (so oversized chunks still progress)
/// or if it stays within the budget.
fn fits(flow: &Flow, len: usize, max_pending_bytes: usize) -> bool {
    flow.pending_bytes == 0 || flow.pending_bytes + len <= max_pending_bytes
}

impl FlowGate {
    pub fn new(max_pending_bytes: usize) -> Self {
        let (tx, _) = watch::channel(Flow {
            state: PipelineState::Idle,
            pending_bytes: 0,
            bytes_submitted: 0,
            bytes_written: 0,
            chunks_written: 0,
            reason: None,
        });

        Self {
            tx,
            max_pending_bytes,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.tx.borrow().state
    }

    pub fn snapshot(&self) -> Flow {
        self.tx.borrow().clone()
    }

    /// Move to a new state; nothing leaves `Terminated`
    pub fn set_state(&self, state: PipelineState) {
        self.tx.send_if_modified(|flow| {
            if flow.state == PipelineState::Terminated || flow.state == state {
                return false;
            }
            flow.state = state;
            true
        });
    }

    /// Reserve room for `len` bytes
    pub fn try_reserve(&self, len: usize) -> Reservation {
        let max = self.max_pending_bytes;
        let mut outcome = Reservation::Closed;

        self.tx.send_if_modified(|flow| {
            if flow.state != PipelineState::Active {
                outcome = Reservation::Closed;
                return false;
            }
            if !fits(flow, len, max) {
                outcome = Reservation::Saturated;
                return false;
            }
            flow.pending_bytes += len;
            flow.bytes_submitted += len as u64;
            outcome = Reservation::Accepted;
            true
        });

        outcome
    }

    /// Undo a reservation whose chunk never reached the supervisor
    pub fn cancel(&self, len: usize) {
        self.tx.send_modify(|flow| {
            flow.pending_bytes = flow.pending_bytes.saturating_sub(len);
            flow.bytes_submitted = flow.bytes_submitted.saturating_sub(len as u64);
        });
    }

    /// Record `len` bytes written to the process
    pub fn complete(&self, len: usize) {
        self.tx.send_modify(|flow| {
            flow.pending_bytes = flow.pending_bytes.saturating_sub(len);
            flow.bytes_written += len as u64;
            flow.chunks_written += 1;
        });
    }

    /// Enter `Terminated`; returns false if already there
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        self.tx.send_if_modified(|flow| {
            if flow.state == PipelineState::Terminated {
                return false;
            }
            flow.state = PipelineState::Terminated;
            flow.reason = Some(reason);
            true
        })
    }

    /// Wait until `len` bytes would fit or the pipeline stops accepting
    pub async fn ready(&self, len: usize) {
        let max = self.max_pending_bytes;
        let mut rx = self.tx.subscribe();
        let _ = rx
            .wait_for(|flow| flow.state != PipelineState::Active || fits(flow, len, max))
            .await;
    }

    /// Wait for `Terminated`
    pub async fn terminated(&self) -> TerminationReason {
        let mut rx = self.tx.subscribe();
        let reason = match rx
            .wait_for(|flow| flow.state == PipelineState::Terminated)
            .await
        {
            Ok(flow) => flow.reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(TerminationReason::Aborted)
    }
}
