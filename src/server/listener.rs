//! Signaling server listener
//!
//! Handles the TCP accept loop and spawns a task per WebSocket connection.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use crate::server::config::ServerConfig;
use crate::server::connection::Connection;
use crate::stats::ServerStats;

/// Counters shared with connection tasks
#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_sessions: AtomicU64,
}

/// Decrements the active session count when a connection task ends
struct ActiveSession(Arc<Counters>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Whether an accept error only affects the connection being accepted
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// WebSocket signaling and ingest server
pub struct SignalServer {
    config: ServerConfig,
    router: Arc<Router>,
    event_task: JoinHandle<()>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    counters: Arc<Counters>,
    started_at: Instant,
}

impl SignalServer {
    /// Create a new server with the given configuration
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let (router, events) = Router::new(config.router.clone());
        let router = Arc::new(router);
        let event_task = router.spawn_event_task(events);

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            router,
            event_task,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            counters: Arc::new(Counters::default()),
            started_at: Instant::now(),
        }
    }

    /// Get a reference to the connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.router.registry()
    }

    /// Get a reference to the router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server
    ///
    /// Returns only if accepting fails with a non-transient error.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_until(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// On shutdown every pipeline is stopped and the registry is cleared
    /// before this returns.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            profile = ?self.config.router.profile,
            "Signal server listening"
        );

        let stats_handle = self.spawn_stats_task();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        if let Some(handle) = stats_handle {
            handle.abort();
        }
        self.router.shutdown().await;

        result
    }

    /// Snapshot of server-wide statistics
    pub async fn stats(&self) -> ServerStats {
        collect_stats(&self.router, &self.counters, self.started_at).await
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Listener failed");
                    return Err(e.into());
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_sessions.fetch_add(1, Ordering::Relaxed);
        let active = ActiveSession(Arc::clone(&self.counters));

        let config = self.config.clone();
        let router = Arc::clone(&self.router);

        tokio::spawn(async move {
            let _permit = permit;
            let _active = active;
            let mut connection = Connection::new(session_id, socket, peer_addr, config, router);

            if let Err(e) = connection.run().await {
                tracing::debug!(
                    session_id = session_id,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }

    fn spawn_stats_task(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.stats_interval;
        if interval.is_zero() {
            return None;
        }

        let router = Arc::clone(&self.router);
        let counters = Arc::clone(&self.counters);
        let started_at = self.started_at;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = collect_stats(&router, &counters, started_at).await;
                tracing::info!(
                    total_connections = stats.total_connections,
                    active_sessions = stats.active_sessions,
                    publishers = stats.publishers,
                    viewers = stats.viewers,
                    peers = stats.peers,
                    active_pipelines = stats.active_pipelines,
                    uptime_secs = stats.uptime.as_secs(),
                    "Server stats"
                );
            }
        }))
    }
}

impl Drop for SignalServer {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

async fn collect_stats(router: &Router, counters: &Counters, started_at: Instant) -> ServerStats {
    let counts = router.registry().partition_counts().await;
    ServerStats {
        total_connections: counters.total_connections.load(Ordering::Relaxed),
        active_sessions: counters.active_sessions.load(Ordering::Relaxed),
        publishers: counts.publishers,
        viewers: counts.viewers,
        peers: counts.peers,
        active_pipelines: counts.streaming,
        uptime: started_at.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
        ] {
            assert!(is_transient(&io::Error::from(kind)));
        }
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_shutdown_before_any_connection() {
        let server = SignalServer::new(ServerConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        server.serve_until(listener, async {}).await.unwrap();

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.registered(), 0);
    }
}
