// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound packet pipeline.
//!
//! Every packet, whether it arrived from a peer or was just written locally,
//! goes through the same steps:
//!
//! ```text
//! advance clock ─► merge into store ─► publish outcome
//!                                           │
//!                        (added/updated) ───┤
//!                                           ▼
//!                              forward to further receivers
//!                                           │
//!                                           ▼
//!                          connect to peers named but unknown
//! ```
//!
//! Forwarding only follows accepted writes, so a duplicate arrival is
//! absorbed instead of re-flooded.

use super::ReplicationEngine;
use crate::events::EventKind;
use crate::metrics;
use crate::packet::{Packet, PeerId};
use crate::storage::Persistence;
use crate::store::KeyedStore;
use crate::transport::Transport;
use rand::Rng;
use tracing::debug;

impl<T: Transport, P: Persistence, R: Rng> ReplicationEngine<T, P, R> {
    pub(super) fn handle_packet(&mut self, packet: Packet) -> EventKind {
        self.clock = self.clock.max(packet.t);

        let created = !self.stores.contains_key(&packet.db);
        let keys = &self.keys;
        let policy = self.config.conflict_policy;
        let storage = &self.storage;
        let store = self
            .stores
            .entry(packet.db.clone())
            .or_insert_with(|| KeyedStore::open(&packet.db, keys.snapshot(&packet.db), policy, storage));

        let kind = store.put(&packet.id, packet.stamp(), packet.data.clone(), &mut self.storage);
        if created {
            self.register_database(&packet.db);
        }

        metrics::record_packet_received(&packet.db, kind.as_str());
        self.events.publish(kind, &packet.db, &packet.id, &packet.data);

        if kind.is_accepted() {
            self.forward_to_further_receivers(&packet);
        }
        self.connect_to_unknown_nodes(&packet);

        kind
    }

    /// Send the packet to every tracked peer not yet on its receiver list.
    fn forward_to_further_receivers(&self, packet: &Packet) -> usize {
        let own = &self.config.node_id;
        let further: Vec<PeerId> = self
            .links
            .known_peer_ids()
            .into_iter()
            .filter(|peer| peer != own && *peer != packet.src && !packet.rcv.contains(peer))
            .collect();

        if further.is_empty() {
            return 0;
        }

        let next = packet.with_receivers(&further);
        for peer in &further {
            self.links.send_to(peer, &next);
        }

        debug!(
            db = %packet.db,
            id = %packet.id,
            t = packet.t,
            further = ?further,
            "Forwarded packet"
        );
        metrics::record_packets_forwarded(further.len());
        further.len()
    }

    /// Dial every peer the packet names that we do not track yet.
    fn connect_to_unknown_nodes(&mut self, packet: &Packet) {
        let mut opened = 0;
        for peer in packet.rcv.iter().chain(std::iter::once(&packet.src)) {
            if *peer == self.config.node_id {
                continue;
            }
            if self.ensure_link(peer) {
                opened += 1;
            }
        }
        if opened > 0 {
            debug!(opened, src = %packet.src, "Connected to peers learned from gossip");
            metrics::record_topology_repair(opened);
        }
    }

    /// Send every stored record to a freshly opened link.
    pub(super) fn dump_databases_to(&self, peer: &str) {
        let own = &self.config.node_id;
        let receivers = self.links.known_peer_ids();
        let mut entries = 0;

        for (name, store) in &self.stores {
            for (id, record) in store.iter() {
                let packet = Packet {
                    src: own.clone(),
                    t: record.time,
                    rcv: receivers.clone(),
                    db: name.clone(),
                    id: id.to_string(),
                    data: record.value.clone(),
                    origin: (record.origin != *own).then(|| record.origin.clone()),
                };
                self.links.send_to(peer, &packet);
                entries += 1;
            }
        }

        debug!(peer_id = %peer, entries, "Dumped databases");
        metrics::record_dump_sent(peer, entries);
    }
}
