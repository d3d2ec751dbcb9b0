// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Point-to-point link collaborator.
//!
//! The engine never waits on the network. Opening a link returns a handle
//! immediately; whether the link actually came up (or failed, or delivered
//! data) is reported later as a [`TransportEvent`] that the owner of the
//! engine feeds back through
//! [`ReplicationEngine::handle_transport_event`](crate::ReplicationEngine::handle_transport_event).
//!
//! ```text
//! engine ── open(peer) ──► Transport ──► Link handle (Opening)
//!    ▲                                        │
//!    └──── Opened / Data / Errored / Closed ◄─┘   (later, via the event loop)
//! ```
//!
//! [`channel`] ships an in-process implementation over tokio channels.

pub mod channel;

use crate::packet::{Packet, PeerId};

/// Handle to one link. Sending is fire-and-forget.
pub trait Link {
    fn send(&self, packet: &Packet);
}

/// Factory for links plus the rendezvous session used to establish them.
pub trait Transport {
    type Link: Link;

    /// Start opening a link to `peer`. The outcome arrives as an event.
    fn open(&mut self, peer: &PeerId) -> Self::Link;

    /// Whether the signalling session used to open new links was lost.
    fn is_disconnected_from_rendezvous(&self) -> bool {
        false
    }

    /// Re-establish the signalling session.
    fn reconnect_to_rendezvous(&mut self) {}
}

/// Notification from the transport, delivered to the engine in arrival order.
#[derive(Debug)]
pub enum TransportEvent<L> {
    /// A remote peer opened a link to us.
    Incoming { peer: PeerId, link: L },
    /// The link to `peer` is open.
    Opened(PeerId),
    /// A packet arrived over the link to `from`.
    Data { from: PeerId, packet: Packet },
    /// The link to `peer` failed.
    Errored { peer: PeerId, reason: String },
    /// The link to `peer` was closed.
    Closed(PeerId),
}

impl<L> TransportEvent<L> {
    /// Peer the event concerns.
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::Incoming { peer, .. } => peer,
            Self::Opened(peer) => peer,
            Self::Data { from, .. } => from,
            Self::Errored { peer, .. } => peer,
            Self::Closed(peer) => peer,
        }
    }

    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Incoming { .. } => "incoming",
            Self::Opened(_) => "opened",
            Self::Data { .. } => "data",
            Self::Errored { .. } => "errored",
            Self::Closed(_) => "closed",
        }
    }
}
