//! Outbound side of a transport session

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Serialized text frame, shared between all recipients of a broadcast
pub type OutboundFrame = Arc<str>;

/// Why a frame could not be queued for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Session is closing or its writer has exited
    Closed,
    /// Outbound queue is full (client is not reading)
    Full,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "Session closed"),
            SendError::Full => write!(f, "Outbound queue full"),
        }
    }
}

impl std::error::Error for SendError {}

/// Non-owning reference to a transport session, used only to send frames
///
/// Sending never waits: a slow client fills its own bounded queue and further
/// frames to it fail with [`SendError::Full`] instead of stalling the sender.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    tx: mpsc::Sender<OutboundFrame>,
    closing: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Create a handle and the receiver drained by the session's writer
    pub fn channel(id: u64, capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            tx,
            closing: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    /// Session ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for delivery
    pub fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }

        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Mark the session as closing; later sends fail and fan-out skips it
    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Check if the session is closing or gone
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (handle, mut rx) = SessionHandle::channel(7, 4);
        assert_eq!(handle.id(), 7);

        handle.send(OutboundFrame::from("hello")).unwrap();
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn test_full_queue() {
        let (handle, _rx) = SessionHandle::channel(1, 1);

        handle.send(OutboundFrame::from("a")).unwrap();
        assert_eq!(handle.send(OutboundFrame::from("b")), Err(SendError::Full));
    }

    #[test]
    fn test_closing_and_dropped_receiver() {
        let (handle, rx) = SessionHandle::channel(1, 4);
        let clone = handle.clone();

        handle.mark_closing();
        assert!(clone.is_closed());
        assert_eq!(clone.send(OutboundFrame::from("x")), Err(SendError::Closed));

        let (handle, rx2) = SessionHandle::channel(2, 4);
        drop(rx2);
        assert!(handle.is_closed());
        assert_eq!(handle.send(OutboundFrame::from("x")), Err(SendError::Closed));
        drop(rx);
    }
}
