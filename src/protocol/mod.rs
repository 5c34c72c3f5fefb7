//! Signaling wire protocol
//!
//! Clients speak JSON text frames discriminated by a kebab-case `type` field.
//! This module provides:
//! - Inbound envelope parsing with per-kind validation
//! - Opaque signaling payloads forwarded without re-encoding
//! - Outbound server messages

pub mod message;
pub mod reply;

pub use message::{Envelope, MessageKind, SignalEnvelope, SignalKind};
pub use reply::{ErrorCode, ServerMessage};
