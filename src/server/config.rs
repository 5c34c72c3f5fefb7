//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::router::RouterConfig;

/// Default listening port
pub const DEFAULT_PORT: u16 = 8080;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Connection timeout (WebSocket upgrade must complete within this time)
    pub connection_timeout: Duration,

    /// Largest accepted WebSocket message, in bytes
    pub max_message_size: usize,

    /// Frames that may wait for a slow client before further sends to it fail
    pub outbound_queue_capacity: usize,

    /// Stats log interval (zero disables)
    pub stats_interval: Duration,

    /// Message routing and ingest
    pub router: RouterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 0, // Unlimited
            tcp_nodelay: true,
            connection_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16MB
            outbound_queue_capacity: 256,
            stats_interval: Duration::from_secs(30),
            router: RouterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set per-session outbound queue capacity (at least one frame)
    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    /// Set stats interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set router config
    pub fn router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::SignalingProfile;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.outbound_queue_capacity, 256);
        assert!(config.tcp_nodelay);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.router.profile, SignalingProfile::Multiplexed);
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let config = ServerConfig::with_addr(addr);

        assert_eq!(config.bind_addr.port(), 9001);
    }

    #[test]
    fn test_builder_connection_timeout() {
        let config = ServerConfig::default().connection_timeout(Duration::from_secs(30));

        assert_eq!(config.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_outbound_queue_capacity_clamped() {
        let config = ServerConfig::default().outbound_queue_capacity(0);

        assert_eq!(config.outbound_queue_capacity, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .max_connections(50)
            .max_message_size(1024)
            .stats_interval(Duration::ZERO)
            .router(RouterConfig::for_profile(SignalingProfile::PeerOnly));

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.stats_interval, Duration::ZERO);
        assert_eq!(config.router.profile, SignalingProfile::PeerOnly);
    }
}
