//! Session state machine
//!
//! Tracks a transport session from connection to close:
//! `Unregistered -> Registered -> Closed`.

use std::net::SocketAddr;
use std::time::Instant;

use super::handle::SessionHandle;
use crate::registry::Role;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Connected, only registration messages are accepted
    Unregistered,
    /// Registered in the connection registry
    Registered,
    /// Left or disconnected (terminal)
    Closed,
}

/// Complete session state, owned by the session task
#[derive(Debug)]
pub struct SessionState {
    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current phase
    pub phase: SessionPhase,

    /// Registered identity
    pub identity: Option<String>,

    /// Registered role
    pub role: Option<Role>,

    /// Connection start time
    pub connected_at: Instant,

    /// Time when registration completed
    pub registered_at: Option<Instant>,

    /// Frames received from the client
    pub messages_received: u64,

    /// Frames dropped as protocol errors
    pub messages_rejected: u64,

    handle: SessionHandle,
}

impl SessionState {
    /// Create a new session state
    pub fn new(handle: SessionHandle, peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            phase: SessionPhase::Unregistered,
            identity: None,
            role: None,
            connected_at: Instant::now(),
            registered_at: None,
            messages_received: 0,
            messages_rejected: 0,
            handle,
        }
    }

    /// Session ID
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Outbound handle for this session
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Record a successful registration
    pub fn on_registered(&mut self, identity: String, role: Role) {
        if self.phase == SessionPhase::Unregistered {
            self.identity = Some(identity);
            self.role = Some(role);
            self.registered_at = Some(Instant::now());
            self.phase = SessionPhase::Registered;
        }
    }

    /// Enter the terminal phase
    ///
    /// Returns the identity that was registered, if any, so the caller can
    /// remove it from the registry exactly once.
    pub fn close(&mut self) -> Option<String> {
        if self.phase == SessionPhase::Closed {
            return None;
        }
        self.phase = SessionPhase::Closed;
        self.handle.mark_closing();
        self.identity.take()
    }

    /// Registered identity
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Check if the session is registered
    pub fn is_registered(&self) -> bool {
        self.phase == SessionPhase::Registered
    }

    /// Check if the session is closed
    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    /// Get session duration
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }
}
