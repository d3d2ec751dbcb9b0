// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process transport over tokio channels.
//!
//! A [`ChannelNetwork`] is the rendezvous: every node registers its peer id
//! and receives an unbounded event queue. Opening a link to a registered peer
//! succeeds immediately (both sides get `Opened`, the remote side also gets
//! `Incoming`); opening a link to an unknown peer yields `Errored`.
//!
//! [`ChannelNetwork::disconnect`] removes a node from the rendezvous and
//! tells every other node its links are closed. The node's transport then
//! reports itself disconnected until it reconnects.

use super::{Link, Transport, TransportEvent};
use crate::error::ReplicationError;
use crate::packet::{Packet, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type EventSender = mpsc::UnboundedSender<TransportEvent<ChannelLink>>;

/// Receiving half of a node's event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent<ChannelLink>>;

/// Shared registry of reachable nodes.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    nodes: Arc<Mutex<HashMap<PeerId, EventSender>>>,
}

impl std::fmt::Debug for ChannelNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelNetwork")
            .field("nodes", &self.node_ids())
            .finish()
    }
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<PeerId, EventSender>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sender(&self, peer: &str) -> Option<EventSender> {
        self.nodes().get(peer).cloned()
    }

    /// Join the network as `peer`.
    pub fn register(&self, peer: impl Into<PeerId>) -> (ChannelTransport, EventReceiver) {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes().insert(peer.clone(), tx.clone());
        debug!(peer_id = %peer, "Registered on channel network");
        let transport = ChannelTransport {
            me: peer,
            events: tx,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Drop `peer` from the rendezvous and close every link towards it.
    pub fn disconnect(&self, peer: &str) {
        let others: Vec<EventSender> = {
            let mut nodes = self.nodes();
            if nodes.remove(peer).is_none() {
                return;
            }
            nodes.values().cloned().collect()
        };
        for tx in others {
            let _ = tx.send(TransportEvent::Closed(peer.to_string()));
        }
        debug!(peer_id = %peer, "Disconnected from channel network");
    }

    pub fn is_registered(&self, peer: &str) -> bool {
        self.nodes().contains_key(peer)
    }

    /// Registered node ids, sorted.
    pub fn node_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.nodes().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// One node's view of a [`ChannelNetwork`].
#[derive(Debug)]
pub struct ChannelTransport {
    me: PeerId,
    events: EventSender,
    network: ChannelNetwork,
}

impl ChannelTransport {
    pub fn peer_id(&self) -> &str {
        &self.me
    }
}

impl Transport for ChannelTransport {
    type Link = ChannelLink;

    fn open(&mut self, peer: &PeerId) -> ChannelLink {
        let link = ChannelLink {
            from: self.me.clone(),
            to: peer.clone(),
            network: self.network.clone(),
        };

        match self.network.sender(peer) {
            Some(remote) => {
                let back = ChannelLink {
                    from: peer.clone(),
                    to: self.me.clone(),
                    network: self.network.clone(),
                };
                let _ = remote.send(TransportEvent::Incoming {
                    peer: self.me.clone(),
                    link: back,
                });
                let _ = remote.send(TransportEvent::Opened(self.me.clone()));
                let _ = self.events.send(TransportEvent::Opened(peer.clone()));
            }
            None => {
                let err = ReplicationError::transport(peer.clone(), "peer not registered");
                let _ = self.events.send(TransportEvent::Errored {
                    peer: peer.clone(),
                    reason: err.to_string(),
                });
            }
        }

        link
    }

    fn is_disconnected_from_rendezvous(&self) -> bool {
        !self.network.is_registered(&self.me)
    }

    fn reconnect_to_rendezvous(&mut self) {
        self.network
            .nodes()
            .insert(self.me.clone(), self.events.clone());
        debug!(peer_id = %self.me, "Rejoined channel network");
    }
}

/// Link handle that posts packets into the remote node's queue.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    from: PeerId,
    to: PeerId,
    network: ChannelNetwork,
}

impl ChannelLink {
    pub fn remote(&self) -> &str {
        &self.to
    }
}

impl Link for ChannelLink {
    fn send(&self, packet: &Packet) {
        let Some(remote) = self.network.sender(&self.to) else {
            debug!(peer_id = %self.to, "Dropping packet for unreachable peer");
            return;
        };
        let event = TransportEvent::Data {
            from: self.from.clone(),
            packet: packet.clone(),
        };
        if remote.send(event).is_err() {
            warn!(peer_id = %self.to, "Peer event queue closed");
        }
    }
}
