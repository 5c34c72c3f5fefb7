//! Connection registry implementation
//!
//! The single source of truth for who is online. Every mutation goes through
//! one `RwLock`, which broadcast fan-out also holds while iterating.

use std::collections::HashMap;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::entry::{Connection, ConnectionInfo, PartitionCounts, Role};
use super::error::RegistryError;
use crate::ingest::PipelineHandle;
use crate::session::SessionHandle;

/// Longest accepted identity, in characters
pub const MAX_IDENTITY_LEN: usize = 64;

/// Trim and check a client-supplied identity
pub fn validate_identity(raw: &str) -> Result<String, RegistryError> {
    let identity = raw.trim();
    let len = identity.chars().count();

    if len == 0 || len > MAX_IDENTITY_LEN || identity.chars().any(char::is_control) {
        return Err(RegistryError::InvalidIdentity(raw.to_string()));
    }

    Ok(identity.to_string())
}

#[derive(Debug, Default)]
pub(super) struct Inner {
    pub connections: HashMap<String, Connection>,
    /// Identities in registration order
    pub order: Vec<String>,
}

impl Inner {
    /// Connections in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.order
            .iter()
            .filter_map(|identity| self.connections.get(identity))
    }
}

/// Registry of live connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    pub(super) inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection
    ///
    /// Fails if the identity is invalid or already registered; the existing
    /// connection is left untouched.
    pub async fn register(
        &self,
        identity: &str,
        role: Role,
        session: SessionHandle,
        display_name: Option<String>,
    ) -> Result<ConnectionInfo, RegistryError> {
        let identity = validate_identity(identity)?;
        self.insert(Connection::new(identity, role, session, display_name))
            .await
    }

    /// Register an anonymous peer under a fresh UUID
    pub async fn register_anonymous(
        &self,
        session: SessionHandle,
        display_name: Option<String>,
    ) -> Result<ConnectionInfo, RegistryError> {
        let display_name = display_name
            .map(|name| validate_identity(&name))
            .transpose()?;
        let identity = Uuid::new_v4().to_string();
        self.insert(Connection::anonymous(identity, session, display_name))
            .await
    }

    async fn insert(&self, conn: Connection) -> Result<ConnectionInfo, RegistryError> {
        let mut inner = self.inner.write().await;

        if inner.connections.contains_key(&conn.identity) {
            return Err(RegistryError::DuplicateIdentity(conn.identity));
        }

        let info = conn.info();
        inner.order.push(conn.identity.clone());
        inner.connections.insert(conn.identity.clone(), conn);

        tracing::info!(
            identity = %info.identity,
            role = %info.role,
            session_id = info.session.id(),
            connections = inner.connections.len(),
            "Connection registered"
        );

        Ok(info)
    }

    /// Remove a connection and stop its pipeline
    ///
    /// Removing an unknown identity is a no-op. The pipeline is stopped after
    /// the lock is released, but before this returns.
    pub async fn remove(&self, identity: &str) -> Option<ConnectionInfo> {
        let mut conn = {
            let mut inner = self.inner.write().await;
            let conn = inner.connections.remove(identity)?;
            inner.order.retain(|id| id != identity);

            tracing::info!(
                identity = %identity,
                role = %conn.role,
                connections = inner.connections.len(),
                "Connection removed"
            );
            conn
        };

        let info = conn.info();
        if let Some(pipeline) = conn.pipeline.take() {
            let reason = pipeline.stop().await;
            tracing::debug!(identity = %identity, reason = %reason, "Pipeline released with connection");
        }

        Some(info)
    }

    /// Look up a connection
    pub async fn find(&self, identity: &str) -> Option<ConnectionInfo> {
        self.inner
            .read()
            .await
            .connections
            .get(identity)
            .map(Connection::info)
    }

    /// Registered identities in registration order, optionally for one role
    pub async fn list_identities(&self, role: Option<Role>) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .filter(|conn| role.map_or(true, |r| conn.role == r))
            .map(|conn| conn.identity.clone())
            .collect()
    }

    /// Identities in any of the given roles, in registration order
    pub async fn list_partitions(&self, roles: &[Role]) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .filter(|conn| roles.contains(&conn.role))
            .map(|conn| conn.identity.clone())
            .collect()
    }

    /// Publishers with a live pipeline, in registration order
    pub async fn streaming_publishers(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .filter(|conn| conn.role == Role::Publisher && conn.is_streaming())
            .map(|conn| conn.identity.clone())
            .collect()
    }

    /// Attach a pipeline to a connection
    ///
    /// Returns a pipeline that was displaced, which the caller must stop.
    /// Fails if the connection is gone; the caller then owns the only
    /// remaining handles to the new pipeline.
    pub async fn attach_pipeline(
        &self,
        identity: &str,
        pipeline: PipelineHandle,
    ) -> Result<Option<PipelineHandle>, RegistryError> {
        let mut inner = self.inner.write().await;
        let conn = inner
            .connections
            .get_mut(identity)
            .ok_or_else(|| RegistryError::NotFound(identity.to_string()))?;

        Ok(conn.pipeline.replace(pipeline))
    }

    /// Detach the connection's pipeline, if any
    pub async fn take_pipeline(&self, identity: &str) -> Option<PipelineHandle> {
        let mut inner = self.inner.write().await;
        inner.connections.get_mut(identity)?.pipeline.take()
    }

    /// Detach the pipeline only if it is still the one with `pipeline_id`
    pub async fn detach_pipeline(&self, identity: &str, pipeline_id: u64) -> Option<PipelineHandle> {
        let mut inner = self.inner.write().await;
        let conn = inner.connections.get_mut(identity)?;

        if conn.pipeline.as_ref().map(PipelineHandle::id) == Some(pipeline_id) {
            conn.pipeline.take()
        } else {
            None
        }
    }

    /// Clone of the connection's pipeline handle
    pub async fn pipeline(&self, identity: &str) -> Option<PipelineHandle> {
        let inner = self.inner.read().await;
        inner.connections.get(identity)?.pipeline.clone()
    }

    /// Get total number of registered connections
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Check if no connection is registered
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }

    /// Count connections per partition
    pub async fn partition_counts(&self) -> PartitionCounts {
        let inner = self.inner.read().await;
        let mut counts = PartitionCounts::default();

        for conn in inner.connections.values() {
            match conn.role {
                Role::Publisher => counts.publishers += 1,
                Role::Viewer => counts.viewers += 1,
                Role::Peer => counts.peers += 1,
            }
            if conn.is_streaming() {
                counts.streaming += 1;
            }
        }

        counts
    }

    /// Remove every connection and stop every pipeline
    ///
    /// Returns once all transcoder processes have been reaped.
    pub async fn clear(&self) -> Vec<ConnectionInfo> {
        let drained: Vec<Connection> = {
            let mut inner = self.inner.write().await;
            let order = std::mem::take(&mut inner.order);
            let mut connections = std::mem::take(&mut inner.connections);
            order
                .iter()
                .filter_map(|identity| connections.remove(identity))
                .collect()
        };

        let infos: Vec<ConnectionInfo> = drained.iter().map(Connection::info).collect();
        let pipelines: Vec<PipelineHandle> = drained
            .into_iter()
            .filter_map(|conn| conn.pipeline)
            .collect();

        if !pipelines.is_empty() {
            tracing::info!(pipelines = pipelines.len(), "Stopping all pipelines");
            join_all(pipelines.iter().map(PipelineHandle::stop)).await;
        }

        infos
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::ingest::{PipelineEvent, PipelineState, TerminationReason, TranscoderConfig};

    fn session(id: u64) -> SessionHandle {
        SessionHandle::channel(id, 8).0
    }

    fn cat_config(root: &std::path::Path) -> TranscoderConfig {
        TranscoderConfig::default()
            .program("sh")
            .args(["-c", "cat > /dev/null"])
            .output_root(root)
            .grace_period(Duration::from_secs(2))
    }

    async fn spawn_pipeline(identity: &str, root: &std::path::Path) -> PipelineHandle {
        let (events, _rx) = tokio::sync::mpsc::unbounded_channel::<PipelineEvent>();
        PipelineHandle::spawn(identity, identity, &cat_config(root), events)
            .await
            .unwrap()
    }

    #[test]
    fn test_validate_identity() {
        assert_eq!(validate_identity("  alice ").unwrap(), "alice");
        assert_eq!(validate_identity("Zoë").unwrap(), "Zoë");
        assert!(validate_identity(&"x".repeat(MAX_IDENTITY_LEN)).is_ok());

        for bad in ["", "   ", "a\nb", "tab\there"] {
            assert_eq!(
                validate_identity(bad),
                Err(RegistryError::InvalidIdentity(bad.to_string()))
            );
        }
        assert!(validate_identity(&"x".repeat(MAX_IDENTITY_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_register_and_find() {
        let registry = ConnectionRegistry::new();

        let info = registry
            .register("alice", Role::Publisher, session(1), None)
            .await
            .unwrap();
        assert_eq!(info.identity, "alice");

        let found = registry.find("alice").await.unwrap();
        assert_eq!(found.role, Role::Publisher);
        assert_eq!(found.session.id(), 1);
        assert!(registry.find("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let registry = ConnectionRegistry::new();
        registry
            .register("alice", Role::Publisher, session(1), None)
            .await
            .unwrap();

        let result = registry.register("alice", Role::Viewer, session(2), None).await;
        assert_eq!(result.unwrap_err(), RegistryError::DuplicateIdentity("alice".into()));

        // The original connection is untouched
        let found = registry.find("alice").await.unwrap();
        assert_eq!(found.role, Role::Publisher);
        assert_eq!(found.session.id(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_in_registration_order() {
        let registry = ConnectionRegistry::new();
        registry.register("carol", Role::Peer, session(1), None).await.unwrap();
        registry.register("alice", Role::Publisher, session(2), None).await.unwrap();
        registry.register("vic", Role::Viewer, session(3), None).await.unwrap();
        registry.register("bob", Role::Peer, session(4), None).await.unwrap();

        assert_eq!(
            registry.list_identities(None).await,
            vec!["carol", "alice", "vic", "bob"]
        );
        assert_eq!(
            registry.list_identities(Some(Role::Peer)).await,
            vec!["carol", "bob"]
        );
        assert_eq!(
            registry.list_partitions(&[Role::Publisher, Role::Peer]).await,
            vec!["carol", "alice", "bob"]
        );

        registry.remove("alice").await;
        registry.register("alice", Role::Publisher, session(5), None).await.unwrap();
        assert_eq!(
            registry.list_identities(None).await,
            vec!["carol", "vic", "bob", "alice"]
        );
    }

    #[tokio::test]
    async fn test_register_anonymous() {
        let registry = ConnectionRegistry::new();

        let first = registry
            .register_anonymous(session(1), Some(" Dana ".into()))
            .await
            .unwrap();
        let second = registry.register_anonymous(session(2), None).await.unwrap();

        assert_ne!(first.identity, second.identity);
        assert!(Uuid::parse_str(&first.identity).is_ok());
        assert!(first.anonymous);
        assert_eq!(first.role, Role::Peer);
        assert_eq!(first.display_name.as_deref(), Some("Dana"));

        let result = registry
            .register_anonymous(session(3), Some("\u{7}".into()))
            .await;
        assert!(matches!(result, Err(RegistryError::InvalidIdentity(_))));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.register("bob", Role::Peer, session(1), None).await.unwrap();

        assert!(registry.remove("bob").await.is_some());
        assert!(registry.remove("bob").await.is_none());
        assert!(registry.remove("nobody").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_registration_single_winner() {
        let registry = Arc::new(ConnectionRegistry::new());

        let mut tasks = Vec::new();
        for id in 0..16u64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.register("alice", Role::Peer, session(id), None).await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.list_identities(None).await, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_remove_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConnectionRegistry::new();
        registry
            .register("alice", Role::Publisher, session(1), None)
            .await
            .unwrap();

        let pipeline = spawn_pipeline("alice", dir.path()).await;
        let displaced = registry
            .attach_pipeline("alice", pipeline.clone())
            .await
            .unwrap();
        assert!(displaced.is_none());
        assert_eq!(registry.streaming_publishers().await, vec!["alice"]);

        let info = registry.remove("alice").await.unwrap();
        assert!(info.streaming);

        // Reaped before remove returned
        assert_eq!(pipeline.state(), PipelineState::Terminated);
        assert_eq!(
            pipeline.terminated().await,
            TerminationReason::Stopped { code: Some(0) }
        );
        assert!(registry.streaming_publishers().await.is_empty());
    }

    #[tokio::test]
    async fn test_attach_to_missing_connection() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConnectionRegistry::new();
        let pipeline = spawn_pipeline("ghost", dir.path()).await;

        let result = registry.attach_pipeline("ghost", pipeline.clone()).await;
        assert_eq!(result.unwrap_err(), RegistryError::NotFound("ghost".into()));

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_detach_matches_pipeline_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConnectionRegistry::new();
        registry
            .register("alice", Role::Publisher, session(1), None)
            .await
            .unwrap();

        let pipeline = spawn_pipeline("alice", dir.path()).await;
        registry.attach_pipeline("alice", pipeline.clone()).await.unwrap();

        assert!(registry.detach_pipeline("alice", pipeline.id() + 1000).await.is_none());
        assert_eq!(registry.pipeline("alice").await.unwrap().id(), pipeline.id());

        let detached = registry.detach_pipeline("alice", pipeline.id()).await.unwrap();
        assert_eq!(detached.id(), pipeline.id());
        assert!(registry.pipeline("alice").await.is_none());

        detached.stop().await;
    }

    #[tokio::test]
    async fn test_clear_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConnectionRegistry::new();

        let mut pipelines = Vec::new();
        for (id, name) in ["alice", "dave"].into_iter().enumerate() {
            registry
                .register(name, Role::Publisher, session(id as u64), None)
                .await
                .unwrap();
            let pipeline = spawn_pipeline(name, dir.path()).await;
            registry.attach_pipeline(name, pipeline.clone()).await.unwrap();
            pipelines.push(pipeline);
        }
        registry.register("vic", Role::Viewer, session(9), None).await.unwrap();

        let counts = registry.partition_counts().await;
        assert_eq!(counts.publishers, 2);
        assert_eq!(counts.viewers, 1);
        assert_eq!(counts.streaming, 2);

        let removed = registry.clear().await;
        assert_eq!(removed.len(), 3);
        assert!(registry.is_empty().await);
        for pipeline in pipelines {
            assert_eq!(pipeline.state(), PipelineState::Terminated);
        }
    }
}
