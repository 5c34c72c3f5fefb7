//! Per-connection session state
//!
//! Each transport session owns a [`SessionState`] for its lifetime and hands
//! a cloneable [`SessionHandle`] to the registry so other tasks can queue
//! outbound frames to it.

pub mod handle;
pub mod state;

pub use handle::{OutboundFrame, SendError, SessionHandle};
pub use state::{SessionPhase, SessionState};
