// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer link bookkeeping.
//!
//! The registry owns every [`PeerLink`] in creation order and remembers which
//! peers have ever been reachable.
//!
//! # Link Lifecycle
//!
//! ```text
//! Opening ──► Open ──► Closed (dormant, kept if ever opened)
//!    │                    ▲
//!    └────────────────────┘  (failed attempt, pruned on next pass)
//! ```
//!
//! A link is *live* while `Opening` or `Open`. A liveness pass
//! ([`ConnectionRegistry::prune_and_maybe_reconnect`]):
//!
//! - drops `Closed` links to peers that never opened
//! - leaves `Opening` links alone; only the transport resolves them
//! - if no live link remains but some peer once opened, opens a fresh link to
//!   one of those peers picked at random
//!
//! The random source is injected so tests can pin the choice.

use crate::metrics;
use crate::packet::{Packet, PeerId};
use crate::transport::Link;
use indexmap::{IndexMap, IndexSet};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// State of a peer link.
///
/// See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Open requested, not yet confirmed.
    Opening,
    /// Confirmed open.
    Open,
    /// Failed or closed.
    Closed,
}

impl LinkState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Opening | Self::Open)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A link to one peer. The handle never changes; reconnecting replaces the
/// whole link.
#[derive(Debug)]
pub struct PeerLink<L> {
    peer_id: PeerId,
    handle: L,
    state: LinkState,
}

impl<L> PeerLink<L> {
    fn new(peer_id: PeerId, handle: L) -> Self {
        Self {
            peer_id,
            handle,
            state: LinkState::Opening,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn handle(&self) -> &L {
        &self.handle
    }
}

/// What a liveness pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessReport {
    /// Links removed from the registry.
    pub pruned: Vec<PeerId>,
    /// Peer chosen by the reconnect fallback.
    pub reconnected: Option<PeerId>,
}

impl LivenessReport {
    pub fn changed(&self) -> bool {
        !self.pruned.is_empty() || self.reconnected.is_some()
    }
}

/// Owner of all peer links.
#[derive(Debug)]
pub struct ConnectionRegistry<L> {
    links: IndexMap<PeerId, PeerLink<L>>,
    ever_opened: IndexSet<PeerId>,
}

impl<L> Default for ConnectionRegistry<L> {
    fn default() -> Self {
        Self {
            links: IndexMap::new(),
            ever_opened: IndexSet::new(),
        }
    }
}

impl<L: Link> ConnectionRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracked peer ids in link-creation order.
    pub fn known_peer_ids(&self) -> Vec<PeerId> {
        self.links.keys().cloned().collect()
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.links.contains_key(peer)
    }

    pub fn get(&self, peer: &str) -> Option<&PeerLink<L>> {
        self.links.get(peer)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink<L>> {
        self.links.values()
    }

    /// Open a link to `peer` unless one is already tracked.
    ///
    /// Returns `true` if a new link was created.
    pub fn ensure_link(&mut self, peer: &PeerId, open: impl FnOnce(&PeerId) -> L) -> bool {
        if self.links.contains_key(peer) {
            return false;
        }
        let handle = open(peer);
        self.insert(peer, handle);
        true
    }

    /// Track `handle` as the link to `peer`, replacing any existing link.
    ///
    /// The peer keeps its position in [`known_peer_ids`](Self::known_peer_ids).
    /// Returns `true` if the peer was not tracked before.
    pub fn insert(&mut self, peer: &PeerId, handle: L) -> bool {
        let replaced = self
            .links
            .insert(peer.clone(), PeerLink::new(peer.clone(), handle))
            .is_some();
        debug!(peer_id = %peer, replaced, "Link tracked");
        metrics::set_known_peers(self.links.len());
        !replaced
    }

    /// Mark `peer` as opened. Returns `false` if the peer is not tracked.
    pub fn record_opened(&mut self, peer: &str) -> bool {
        let Some(link) = self.links.get_mut(peer) else {
            return false;
        };
        link.state = LinkState::Open;
        if self.ever_opened.insert(peer.to_string()) {
            info!(peer_id = %peer, "Peer opened for the first time");
        }
        true
    }

    /// Mark `peer` as closed. Returns `false` if the peer is not tracked.
    pub fn mark_closed(&mut self, peer: &str) -> bool {
        match self.links.get_mut(peer) {
            Some(link) => {
                link.state = LinkState::Closed;
                true
            }
            None => false,
        }
    }

    pub fn is_ever_opened(&self, peer: &str) -> bool {
        self.ever_opened.contains(peer)
    }

    /// Peers that opened at least once, in the order they first opened.
    pub fn ever_opened(&self) -> impl Iterator<Item = &PeerId> {
        self.ever_opened.iter()
    }

    /// Run one liveness pass. See module docs.
    pub fn prune_and_maybe_reconnect<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        open: impl FnOnce(&PeerId) -> L,
    ) -> LivenessReport {
        let mut report = LivenessReport::default();
        let ever_opened = &self.ever_opened;

        self.links.retain(|peer, link| {
            if link.state.is_live() || ever_opened.contains(peer) {
                return true;
            }
            report.pruned.push(peer.clone());
            false
        });

        if !report.pruned.is_empty() {
            info!(pruned = ?report.pruned, "Dropped links that never opened");
            metrics::record_links_pruned(report.pruned.len());
            metrics::set_known_peers(self.links.len());
        }

        if self.live_count() == 0 && !self.ever_opened.is_empty() {
            let index = rng.gen_range(0..self.ever_opened.len());
            if let Some(peer) = self.ever_opened.get_index(index).cloned() {
                info!(peer_id = %peer, "No live links left, reconnecting to a previously reachable peer");
                let handle = open(&peer);
                self.insert(&peer, handle);
                metrics::record_reconnect_fallback();
                report.reconnected = Some(peer);
            }
        }

        report
    }

    /// Send `packet` to every tracked link. Returns the number of sends.
    pub fn broadcast(&self, packet: &Packet) -> usize {
        for link in self.links.values() {
            link.handle.send(packet);
        }
        self.links.len()
    }

    /// Send `packet` to one peer. Returns `false` if the peer is not tracked.
    pub fn send_to(&self, peer: &str, packet: &Packet) -> bool {
        match self.links.get(peer) {
            Some(link) => {
                link.handle.send(packet);
                true
            }
            None => false,
        }
    }

    /// Links in `Opening` or `Open`.
    pub fn live_count(&self) -> usize {
        self.links.values().filter(|l| l.state.is_live()).count()
    }

    pub fn open_count(&self) -> usize {
        self.links
            .values()
            .filter(|l| l.state == LinkState::Open)
            .count()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
