//! Media ingest pipeline
//!
//! Each active publisher owns one transcoder process. The publisher's chunks
//! are written to the process's stdin in submission order by a supervisor
//! task, with a byte budget providing backpressure to the submitting session.
//!
//! # Architecture
//!
//! ```text
//!   session task                      supervisor task            transcoder
//!   ────────────                      ───────────────            ──────────
//!   submit(chunk) ──► reserve bytes
//!        │            (FlowGate)
//!        │ Accepted ─► commands ──────► write_all ──────────────► stdin
//!        │                                 │
//!        │ Backpressured                   └─► release bytes ──┐
//!        └─► ready().await ◄────────── watch::Sender<Flow> ◄───┘
//!
//!   stop() ──► Stop (queued behind chunks) ─► close stdin, wait grace, kill
//!                                             │
//!                                             └─► PipelineEvent::Terminated
//! ```
//!
//! State machine: `Idle -> Starting -> Active -> Draining -> Terminated`.
//! `Terminated` is reachable from every state and is final.

pub mod config;
pub mod error;
pub mod flow;
pub mod pipeline;
pub mod transcoder;

pub use config::TranscoderConfig;
pub use error::PipelineError;
pub use flow::{PipelineState, TerminationReason};
pub use pipeline::{PipelineEvent, PipelineHandle, SubmitOutcome};
pub use transcoder::validate_stream_key;
