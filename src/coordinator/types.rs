//! Node state and health types.
//!
//! # State Transitions
//!
//! ```text
//!           spawn()
//! Starting ─────────→ Running
//!                        │
//!              shutdown()│
//!                        ↓
//!                  ShuttingDown ──→ Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Starting**: Storage opened, engine being constructed.
//! - **Running**: Node task processing commands and transport events.
//! - **ShuttingDown**: Shutdown signalled. Storage is being flushed.
//! - **Stopped**: Node task finished. Commands fail with `Shutdown`.

use crate::packet::PeerId;
use crate::registry::LinkState;
use serde::Serialize;

/// State of a replica node runtime.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Starting => write!(f, "Starting"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot of one tracked link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerHealth {
    pub peer_id: PeerId,
    pub state: LinkState,
    /// The peer was reachable at least once.
    pub ever_opened: bool,
}

/// Point-in-time view of an engine, collected without touching the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeshHealth {
    pub node_id: PeerId,
    pub clock: u64,
    pub databases: usize,
    pub peers_total: usize,
    pub peers_open: usize,
    pub peers_live: usize,
    /// Per-link details in link-creation order.
    pub peers: Vec<PeerHealth>,
}

impl MeshHealth {
    /// At least one link is open.
    pub fn is_connected(&self) -> bool {
        self.peers_open > 0
    }
}
