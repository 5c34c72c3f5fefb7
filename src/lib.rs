//! WebSocket signaling server and media-ingest relay
//!
//! Browser clients register under an identity, discover each other, exchange
//! session negotiation messages (offer, answer, ICE candidates) point to
//! point, and optionally publish a live feed. A publisher's media chunks are
//! piped into an external transcoder process that writes a segmented playlist
//! for pull-based playback.
//!
//! ```text
//!   client ──ws──► Connection task ──► Router ──┬─► ConnectionRegistry (register/remove)
//!                        ▲                      ├─► forward to one session
//!                        │                      ├─► broadcast to partitions
//!                        └── outbound queue ◄───┘
//!                                               └─► PipelineHandle ──► transcoder stdin
//! ```
//!
//! # Example
//!
//! ```no_run
//! use signal_relay::{ServerConfig, SignalServer};
//!
//! #[tokio::main]
//! async fn main() -> signal_relay::Result<()> {
//!     let server = SignalServer::new(ServerConfig::default());
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

pub mod error;
pub mod ingest;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, ProtocolError, Result};
pub use ingest::{PipelineHandle, PipelineState, TranscoderConfig};
pub use protocol::{Envelope, MessageKind, ServerMessage};
pub use registry::{ConnectionRegistry, Role};
pub use router::{Router, RouterConfig, SignalingProfile};
pub use server::{ServerConfig, SignalServer};
pub use session::{SessionHandle, SessionState};
