//! Broadcast fan-out over registry partitions

use super::entry::Role;
use super::store::ConnectionRegistry;
use crate::protocol::ServerMessage;
use crate::session::OutboundFrame;

/// Delivery summary of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Frames queued
    pub delivered: usize,
    /// Recipients skipped because their session is closing
    pub skipped: usize,
    /// Recipients whose queue rejected the frame
    pub failed: usize,
}

impl ConnectionRegistry {
    /// Send a message to every connection in `partitions`
    ///
    /// The message is serialized once and every recipient gets the same
    /// frame. A failed send is logged and does not stop the rest.
    pub async fn broadcast(
        &self,
        message: &ServerMessage,
        partitions: &[Role],
        exclude: Option<&str>,
    ) -> FanoutReport {
        match message.to_frame() {
            Ok(frame) => self.broadcast_frame(&frame, partitions, exclude).await,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping broadcast");
                FanoutReport::default()
            }
        }
    }

    /// Send an already serialized frame to every connection in `partitions`
    pub async fn broadcast_frame(
        &self,
        frame: &OutboundFrame,
        partitions: &[Role],
        exclude: Option<&str>,
    ) -> FanoutReport {
        let inner = self.inner.read().await;
        let mut report = FanoutReport::default();

        for conn in inner.iter() {
            if !partitions.contains(&conn.role) || exclude == Some(conn.identity.as_str()) {
                continue;
            }
            if conn.session.is_closed() {
                report.skipped += 1;
                continue;
            }

            match conn.session.send(OutboundFrame::clone(frame)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        identity = %conn.identity,
                        session_id = conn.session.id(),
                        error = %e,
                        "Broadcast delivery failed"
                    );
                }
            }
        }

        tracing::trace!(
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "Broadcast sent"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::SessionHandle;

    async fn register(
        registry: &ConnectionRegistry,
        identity: &str,
        role: Role,
        capacity: usize,
    ) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
        let (handle, rx) = SessionHandle::channel(identity.len() as u64, capacity);
        registry
            .register(identity, role, handle.clone(), None)
            .await
            .unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_broadcast_partitions() {
        let registry = ConnectionRegistry::new();
        let (_, mut alice) = register(&registry, "alice", Role::Publisher, 8).await;
        let (_, mut vic) = register(&registry, "vic", Role::Viewer, 8).await;
        let (_, mut bob) = register(&registry, "bob", Role::Peer, 8).await;

        let message = ServerMessage::StreamInfo {
            streams: vec!["alice".into()],
        };
        let report = registry.broadcast(&message, &[Role::Viewer], None).await;
        assert_eq!(report.delivered, 1);

        let frame = vic.try_recv().unwrap();
        assert_eq!(&*frame, r#"{"type":"stream-info","streams":["alice"]}"#);
        assert!(alice.try_recv().is_err());
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_shares_one_frame() {
        let registry = ConnectionRegistry::new();
        let (_, mut alice) = register(&registry, "alice", Role::Peer, 8).await;
        let (_, mut bob) = register(&registry, "bob", Role::Peer, 8).await;

        let message = ServerMessage::Users {
            users: vec!["alice".into(), "bob".into()],
        };
        registry.broadcast(&message, &Role::ALL, None).await;

        let a = alice.try_recv().unwrap();
        let b = bob.try_recv().unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_broadcast_survives_failing_recipients() {
        let registry = ConnectionRegistry::new();
        let (closing, _closing_rx) = register(&registry, "closing", Role::Peer, 8).await;
        let (_, full_rx) = register(&registry, "full", Role::Peer, 1).await;
        let (_, mut ok) = register(&registry, "ok", Role::Peer, 8).await;
        let (_, mut excluded) = register(&registry, "excluded", Role::Peer, 8).await;

        closing.mark_closing();
        let message = ServerMessage::UserDisconnected {
            username: "x".into(),
        };

        // Fill the one-slot queue
        registry.broadcast(&message, &[Role::Peer], Some("excluded")).await;
        let report = registry.broadcast(&message, &[Role::Peer], Some("excluded")).await;

        assert_eq!(
            report,
            FanoutReport {
                delivered: 1,
                skipped: 1,
                failed: 1,
            }
        );
        assert!(ok.try_recv().is_ok());
        assert!(ok.try_recv().is_ok());
        assert!(excluded.try_recv().is_err());
        drop(full_rx);
    }
}
