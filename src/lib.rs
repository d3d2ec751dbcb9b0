//! # Mesh Replication
//!
//! Peer-to-peer, eventually consistent, multi-writer key-value replication.
//!
//! ## Architecture
//!
//! Every node keeps a full replica of each named database. Writes are stamped
//! with a logical clock, flooded to every known peer and merged last-writer-wins:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           ReplicationEngine                               │
//! │                                                                           │
//! │  put/add ──► stamp (clock, rcv = known peers) ──► broadcast to links      │
//! │                          │                                                │
//! │                          ▼                                                │
//! │  TransportEvent::Data ──► inbound pipeline ──► KeyedStore (LWW merge)     │
//! │                               │                    │                      │
//! │                               │                    ▼                      │
//! │                               │              EventRouter (listeners)      │
//! │                               ▼                                           │
//! │                 forward to peers not in rcv, dial unknown ids             │
//! │                                                                           │
//! │  ┌────────────────────┐   ┌───────────────────┐   ┌───────────────────┐   │
//! │  │ ConnectionRegistry │   │ Persistence       │   │ Transport         │   │
//! │  │ (liveness, prune)  │   │ (memory / SQLite) │   │ (channel / yours) │   │
//! │  └────────────────────┘   └───────────────────┘   └───────────────────┘   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`store::KeyedStore`]: one named database, snapshot-persisted
//! - [`events::EventRouter`]: per-database, per-outcome listeners
//! - [`registry::ConnectionRegistry`]: peer links and liveness
//! - [`coordinator::ReplicationEngine`]: the single-threaded state machine
//! - [`node::ReplicaNode`]: tokio runtime driving one engine
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mesh_replication::{ChannelNetwork, ReplicaNode, ReplicationConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> mesh_replication::Result<()> {
//!     let network = ChannelNetwork::new();
//!     let mut node = ReplicaNode::start(ReplicationConfig::for_testing("user1"), &network).await?;
//!
//!     node.put("todos", "t1", json!({"done": false})).await?;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod metrics;
pub mod node;
pub mod packet;
pub mod registry;
pub mod storage;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::{LivenessConfig, ReplicationConfig, StorageBackend, StorageConfig};
pub use coordinator::{MeshHealth, NodeState, PeerHealth, ReplicationEngine, MAX_REMOTE_TIME};
pub use error::{ReplicationError, Result};
pub use events::{EventKind, EventRouter, Listener};
pub use node::ReplicaNode;
pub use packet::{Packet, PeerId, Stamp};
pub use registry::{ConnectionRegistry, LinkState, LivenessReport};
pub use storage::{MemoryStorage, Persistence, SqliteStorage, StorageKeys};
pub use store::{ConflictPolicy, KeyedStore, Record};
pub use transport::channel::{ChannelLink, ChannelNetwork, ChannelTransport};
pub use transport::{Link, Transport, TransportEvent};
