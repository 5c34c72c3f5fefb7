//! Connection entry and role types
//!
//! This module defines the per-connection state stored in the registry.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::ingest::{PipelineHandle, PipelineState};
use crate::session::SessionHandle;

/// Role of a registered connection, fixed for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May run an ingest pipeline
    Publisher,
    /// Receives stream listings
    Viewer,
    /// Negotiates peer-to-peer sessions
    Peer,
}

impl Role {
    /// Every role
    pub const ALL: [Role; 3] = [Role::Publisher, Role::Viewer, Role::Peer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Viewer => "viewer",
            Role::Peer => "peer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered participant
///
/// Owned by the registry. The session handle only sends frames; the session
/// task owns the socket.
#[derive(Debug)]
pub struct Connection {
    /// Unique identity
    pub identity: String,

    /// Partition this connection belongs to
    pub role: Role,

    /// Identity was assigned by the server
    pub anonymous: bool,

    /// Client-supplied name for anonymous peers
    pub display_name: Option<String>,

    /// Outbound handle to the transport session
    pub(super) session: SessionHandle,

    /// Running ingest pipeline (publishers only)
    pub(super) pipeline: Option<PipelineHandle>,

    /// When the connection registered
    pub registered_at: Instant,
}

impl Connection {
    pub(super) fn new(
        identity: String,
        role: Role,
        session: SessionHandle,
        display_name: Option<String>,
    ) -> Self {
        Self {
            identity,
            role,
            anonymous: false,
            display_name,
            session,
            pipeline: None,
            registered_at: Instant::now(),
        }
    }

    /// Anonymous peer with a server-assigned identity
    pub(super) fn anonymous(
        identity: String,
        session: SessionHandle,
        display_name: Option<String>,
    ) -> Self {
        Self {
            anonymous: true,
            ..Self::new(identity, Role::Peer, session, display_name)
        }
    }

    /// Whether a pipeline is attached and not yet terminated
    pub fn is_streaming(&self) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|p| p.state() != PipelineState::Terminated)
    }

    /// Snapshot for callers outside the registry lock
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            identity: self.identity.clone(),
            role: self.role,
            anonymous: self.anonymous,
            display_name: self.display_name.clone(),
            session: self.session.clone(),
            streaming: self.is_streaming(),
            registered_at: self.registered_at,
        }
    }
}

/// Point-in-time copy of a [`Connection`]
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub identity: String,
    pub role: Role,
    pub anonymous: bool,
    pub display_name: Option<String>,
    pub session: SessionHandle,
    /// Whether the connection had a live pipeline
    pub streaming: bool,
    pub registered_at: Instant,
}

/// Registered connections per partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionCounts {
    pub publishers: usize,
    pub viewers: usize,
    pub peers: usize,
    /// Publishers with a live pipeline
    pub streaming: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde_names() {
        for role in Role::ALL {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{}\"", role));
            assert_eq!(serde_json::from_str::<Role>(&json).unwrap(), role);
        }
        assert!(serde_json::from_str::<Role>("\"admin\"").is_err());
    }

    #[test]
    fn test_connection_info() {
        let (session, _rx) = SessionHandle::channel(7, 4);
        let conn = Connection::new("alice".into(), Role::Publisher, session, None);

        let info = conn.info();
        assert_eq!(info.identity, "alice");
        assert_eq!(info.role, Role::Publisher);
        assert_eq!(info.session.id(), 7);
        assert!(!info.anonymous);
        assert!(!info.streaming);

        let (session, _rx) = SessionHandle::channel(8, 4);
        let peer = Connection::anonymous("42".into(), session, Some("Dana".into()));
        assert_eq!(peer.role, Role::Peer);
        assert!(peer.info().anonymous);
    }
}
