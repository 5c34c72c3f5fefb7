//! Outbound server messages

use serde::Serialize;

use crate::error::ProtocolError;
use crate::registry::Role;
use crate::session::OutboundFrame;

/// Machine-readable reason carried by `error` replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    DuplicateIdentity,
    InvalidIdentity,
    AlreadyRegistered,
    NotAPublisher,
}

/// Message sent by the server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Registration accepted
    Registered { identity: String, role: Role },
    /// Callable participants (publishers and peers) in registration order
    Users { users: Vec<String> },
    /// An anonymous peer joined
    UserJoined {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    /// An anonymous peer left
    UserLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// A named participant left
    UserDisconnected { username: String },
    /// Publishers with a running ingest pipeline
    StreamInfo { streams: Vec<String> },
    /// The sender's pipeline is accepting chunks
    StreamStarted {
        #[serde(rename = "streamKey")]
        stream_key: String,
    },
    /// The sender's pipeline stopped on request
    StreamStopped {},
    /// The sender's pipeline failed to start or died
    StreamError { message: String },
    /// Request rejected
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    /// Build an `error` reply
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize once into a frame that can be shared between recipients
    pub fn to_frame(&self) -> Result<OutboundFrame, ProtocolError> {
        serde_json::to_string(self)
            .map(OutboundFrame::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}
