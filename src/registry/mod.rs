//! Connection registry and broadcast fan-out
//!
//! The registry maps identities to live connections, partitioned by role. It
//! is the only shared mutable state in the relay: session tasks, the router
//! and the pipeline event loop all go through its async methods.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<ConnectionRegistry>
//!                   ┌──────────────────────────────┐
//!                   │ RwLock<{                     │
//!                   │   connections: HashMap<id,   │
//!                   │     Connection {             │
//!                   │       role, session,         │
//!                   │       pipeline: Option<..>,  │
//!                   │     }>,                      │
//!                   │   order: Vec<id>,            │
//!                   │ }>                           │
//!                   └──────────────┬───────────────┘
//!                                  │
//!        ┌─────────────────────────┼─────────────────────────┐
//!        │                         │                         │
//!        ▼                         ▼                         ▼
//!  register/remove          find(to) ──► send        broadcast(partitions)
//!  (write lock)             (read lock)              (read lock, one frame)
//! ```
//!
//! Pipeline handles are cloned out of the registry before chunks are
//! submitted, so a publisher waiting on backpressure never holds the lock.

pub mod entry;
pub mod error;
pub mod fanout;
pub mod store;

pub use entry::{Connection, ConnectionInfo, PartitionCounts, Role};
pub use error::RegistryError;
pub use fanout::FanoutReport;
pub use store::{validate_identity, ConnectionRegistry, MAX_IDENTITY_LEN};
