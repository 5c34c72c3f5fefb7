//! Crate-wide error types
//!
//! Per-session and per-pipeline failures are reported through these types but
//! never escape their task; only listener failures end `SignalServer::run`.

use std::fmt;
use std::io;

use tokio_tungstenite::tungstenite;

use crate::ingest::PipelineError;
use crate::protocol::MessageKind;
use crate::registry::RegistryError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Socket or process I/O failure
    Io(io::Error),
    /// WebSocket handshake or framing failure
    WebSocket(tungstenite::Error),
    /// Malformed or out-of-order client message
    Protocol(ProtocolError),
    /// Registry conflict
    Registry(RegistryError),
    /// Media ingest failure
    Pipeline(PipelineError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::Pipeline(e) => write!(f, "Pipeline error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::WebSocket(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Registry(e) => Some(e),
            Error::Pipeline(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

impl From<PipelineError> for Error {
    fn from(e: PipelineError) -> Self {
        Error::Pipeline(e)
    }
}

/// Client protocol violations
///
/// These are logged and the offending frame is dropped; the session stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not a JSON object or a field has the wrong shape
    Malformed(String),
    /// Frame has no `type` field
    MissingType,
    /// `type` names no known message
    UnknownType(String),
    /// Message kind is switched off for this deployment
    Disabled(MessageKind),
    /// Non-registration message before the session registered
    NotRegistered(MessageKind),
    /// Registration message on an already registered session
    AlreadyRegistered,
    /// Outbound message could not be serialized
    Encode(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(reason) => write!(f, "Malformed message: {}", reason),
            ProtocolError::MissingType => write!(f, "Message has no type field"),
            ProtocolError::UnknownType(kind) => write!(f, "Unknown message type: {}", kind),
            ProtocolError::Disabled(kind) => write!(f, "Message type disabled: {}", kind),
            ProtocolError::NotRegistered(kind) => {
                write!(f, "Message {} received before registration", kind)
            }
            ProtocolError::AlreadyRegistered => write!(f, "Session is already registered"),
            ProtocolError::Encode(reason) => write!(f, "Failed to encode message: {}", reason),
        }
    }
}

impl std::error::Error for ProtocolError {}
