// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The orchestrator that ties together:
//! - Named databases via [`crate::store::KeyedStore`]
//! - Listener dispatch via [`crate::events::EventRouter`]
//! - Peer links via [`crate::registry::ConnectionRegistry`]
//! - Snapshot persistence via [`crate::storage::Persistence`]
//!
//! # Execution Model
//!
//! The engine is a plain state machine with no internal tasks or locks.
//! Every call (a local write, a transport event) runs to completion before
//! the next one starts, which is what keeps the logical clock, the stores
//! and each packet's receiver list consistent. Transport notifications are
//! fed back through [`ReplicationEngine::handle_transport_event`];
//! [`crate::node::ReplicaNode`] does that from a single tokio task.
//!
//! # Write Path
//!
//! 1. Liveness pass (prune dead attempts, maybe reconnect)
//! 2. Stamp the packet with the logical clock, `rcv` = known peers
//! 3. Broadcast to every tracked link
//! 4. Deliver to self through the inbound pipeline (see `inbound.rs`)

mod inbound;
mod types;

pub use types::{MeshHealth, NodeState, PeerHealth};

use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::events::{EventKind, EventRouter, Listener};
use crate::metrics;
use crate::packet::{Packet, PeerId};
use crate::registry::{ConnectionRegistry, LinkState, LivenessReport};
use crate::storage::{read_string_list, write_string_list, Persistence, StorageKeys};
use crate::store::KeyedStore;
use crate::transport::{Transport, TransportEvent};
use indexmap::IndexMap;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Largest logical time accepted from a peer. Keeps the local clock far
/// from `u64::MAX` so local writes always get a fresh time.
pub const MAX_REMOTE_TIME: u64 = u64::MAX >> 1;

/// One node's replication state.
///
/// Generic over the link transport `T`, the snapshot storage `P` and the
/// random source `R` used by the reconnect fallback.
pub struct ReplicationEngine<T: Transport, P, R> {
    config: ReplicationConfig,
    keys: StorageKeys,
    /// Logical clock: next local write gets this time.
    clock: u64,
    stores: IndexMap<String, KeyedStore>,
    events: EventRouter,
    links: ConnectionRegistry<T::Link>,
    transport: T,
    storage: P,
    rng: R,
}

impl<T: Transport, P: Persistence, R: Rng> ReplicationEngine<T, P, R> {
    /// Create an engine.
    ///
    /// With `clean_start` the persisted namespace is erased. Otherwise every
    /// database named in the registry is loaded and every previously known
    /// peer is dialled.
    pub fn new(config: ReplicationConfig, transport: T, storage: P, rng: R) -> Result<Self> {
        config.validate()?;

        let keys = StorageKeys::new(config.instance_name.clone());
        let mut engine = Self {
            config,
            keys,
            clock: 0,
            stores: IndexMap::new(),
            events: EventRouter::new(),
            links: ConnectionRegistry::new(),
            transport,
            storage,
            rng,
        };

        if engine.config.clean_start {
            engine.clear_namespace();
        } else {
            engine.load_stored_databases();
            engine.connect_to_known_peers();
        }

        info!(
            node_id = %engine.config.node_id,
            instance = %engine.keys.instance(),
            databases = engine.stores.len(),
            peers = engine.links.len(),
            clean_start = engine.config.clean_start,
            "Replication engine started"
        );

        Ok(engine)
    }

    fn read_list(&self, key: &str) -> Vec<String> {
        match read_string_list(&self.storage, key) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable metadata");
                metrics::record_snapshot_load_failure(key);
                Vec::new()
            }
        }
    }

    fn clear_namespace(&mut self) {
        let databases = self.read_list(&self.keys.known_databases());
        for name in &databases {
            self.storage.delete(&self.keys.snapshot(name));
        }
        self.storage.delete(&self.keys.known_databases());
        self.storage.delete(&self.keys.known_peer_ids());
        info!(
            instance = %self.keys.instance(),
            databases = databases.len(),
            "Cleared persisted state"
        );
    }

    fn load_stored_databases(&mut self) {
        for name in self.read_list(&self.keys.known_databases()) {
            self.open_store(&name);
        }
    }

    fn connect_to_known_peers(&mut self) {
        for peer in self.read_list(&self.keys.known_peer_ids()) {
            self.connect_to_node(&peer);
        }
    }

    fn open_store(&mut self, name: &str) -> bool {
        if self.stores.contains_key(name) {
            return false;
        }
        let store = KeyedStore::open(
            name,
            self.keys.snapshot(name),
            self.config.conflict_policy,
            &self.storage,
        );
        self.stores.insert(name.to_string(), store);
        true
    }

    /// Append `name` to the persisted database registry.
    fn register_database(&mut self, name: &str) {
        let key = self.keys.known_databases();
        let mut names = self.read_list(&key);
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
            write_string_list(&mut self.storage, &key, &names);
        }
        debug!(db = %name, "Database created");
    }

    fn persist_known_peers(&mut self) {
        let peers = self.links.known_peer_ids();
        write_string_list(&mut self.storage, &self.keys.known_peer_ids(), &peers);
        metrics::set_known_peers(peers.len());
    }

    fn reconnect_if_disconnected(&mut self) {
        if self.transport.is_disconnected_from_rendezvous() {
            info!(node_id = %self.config.node_id, "Lost rendezvous session, reconnecting");
            self.transport.reconnect_to_rendezvous();
        }
    }

    /// Open a link to `peer` unless one is tracked. Returns `true` if created.
    fn ensure_link(&mut self, peer: &PeerId) -> bool {
        if self.links.contains(peer) {
            return false;
        }
        self.reconnect_if_disconnected();
        let transport = &mut self.transport;
        let created = self.links.ensure_link(peer, |p| transport.open(p));
        if created {
            debug!(peer_id = %peer, "Connecting to peer");
            self.persist_known_peers();
        }
        created
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Write `value` under `id` in `database` and replicate it.
    ///
    /// Returns how the local store took the write. Delivery to peers is
    /// fire-and-forget.
    pub fn put(&mut self, database: &str, id: &str, value: Value) -> EventKind {
        self.check_connections();

        let t = self.clock;
        self.clock = self.clock.saturating_add(1);

        let packet = Packet {
            src: self.config.node_id.clone(),
            t,
            rcv: self.links.known_peer_ids(),
            db: database.to_string(),
            id: id.to_string(),
            data: value,
            origin: None,
        };

        let sent = self.links.broadcast(&packet);
        metrics::record_local_write(database);
        debug!(db = %database, id = %id, t, sent, "Local write");

        self.handle_packet(packet)
    }

    /// Write `value` under a generated id (own id followed by the clock).
    ///
    /// Returns the generated id.
    pub fn add(&mut self, database: &str, value: Value) -> String {
        let id = format!("{}{}", self.config.node_id, self.clock);
        self.put(database, &id, value);
        id
    }

    /// Current value of `id`, `None` if the database or id is unknown.
    pub fn get(&self, database: &str, id: &str) -> Option<&Value> {
        self.stores.get(database).and_then(|s| s.get(id))
    }

    /// Connect to `peer` on request.
    ///
    /// Opens a new link when the peer is untracked or its link is closed.
    pub fn connect_to_node(&mut self, peer: &str) {
        if peer == self.config.node_id {
            warn!(peer_id = %peer, "Refusing to connect to self");
            return;
        }
        self.reconnect_if_disconnected();

        let needs_link = self
            .links
            .get(peer)
            .map_or(true, |link| link.state() == LinkState::Closed);
        if !needs_link {
            debug!(peer_id = %peer, "Already linked");
            return;
        }

        let peer = peer.to_string();
        info!(node_id = %self.config.node_id, peer_id = %peer, "Connecting to node");
        let handle = self.transport.open(&peer);
        if self.links.insert(&peer, handle) {
            self.persist_known_peers();
        }
    }

    /// Register `listener` for each of `kinds` on `database`.
    ///
    /// With `replay`, records already stored are delivered right away (once
    /// per kind).
    pub fn on(&mut self, kinds: &[EventKind], database: &str, replay: bool, listener: Listener) {
        let existing = if replay { self.stores.get(database) } else { None };
        self.events.subscribe(kinds, database, existing, listener);
    }

    /// Feed a transport notification into the engine.
    pub fn handle_transport_event(&mut self, event: TransportEvent<T::Link>) {
        match event {
            TransportEvent::Incoming { peer, link } => {
                info!(peer_id = %peer, "Incoming link");
                if self.links.insert(&peer, link) {
                    self.persist_known_peers();
                }
            }
            TransportEvent::Opened(peer) => {
                if !self.links.record_opened(&peer) {
                    // The attempt was dropped locally while the peer still
                    // holds a link to us; dial again so the dump goes out.
                    info!(peer_id = %peer, "Open notification for untracked peer, redialling");
                    self.ensure_link(&peer);
                    return;
                }
                info!(peer_id = %peer, "Link opened");
                metrics::record_link_event(&peer, "opened");
                metrics::set_open_links(self.links.open_count());
                self.dump_databases_to(&peer);
            }
            TransportEvent::Data { from, packet } => {
                debug!(peer_id = %from, db = %packet.db, id = %packet.id, t = packet.t, "Received packet");
                if packet.t > MAX_REMOTE_TIME {
                    warn!(peer_id = %from, src = %packet.src, t = packet.t, "Dropping packet with out-of-range time");
                    metrics::record_packet_rejected(&packet.db, "time_out_of_range");
                    return;
                }
                self.handle_packet(packet);
            }
            TransportEvent::Errored { peer, reason } => {
                warn!(peer_id = %peer, reason = %reason, "Link error");
                self.links.mark_closed(&peer);
                metrics::record_link_event(&peer, "errored");
                metrics::set_open_links(self.links.open_count());
            }
            TransportEvent::Closed(peer) => {
                info!(peer_id = %peer, "Link closed");
                self.links.mark_closed(&peer);
                metrics::record_link_event(&peer, "closed");
                metrics::set_open_links(self.links.open_count());
            }
        }
    }

    /// Run one liveness pass: recover the rendezvous session, drop links
    /// that never opened, reconnect if nothing live is left.
    pub fn check_connections(&mut self) -> LivenessReport {
        self.reconnect_if_disconnected();

        let transport = &mut self.transport;
        let report = self
            .links
            .prune_and_maybe_reconnect(&mut self.rng, |p| transport.open(p));

        if !report.pruned.is_empty() {
            self.persist_known_peers();
        }
        report
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Logical time the next local write will carry.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Tracked peer ids in link-creation order.
    pub fn known_peer_ids(&self) -> Vec<PeerId> {
        self.links.known_peer_ids()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn database(&self, name: &str) -> Option<&KeyedStore> {
        self.stores.get(name)
    }

    pub fn links(&self) -> &ConnectionRegistry<T::Link> {
        &self.links
    }

    pub fn storage(&self) -> &P {
        &self.storage
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Collect a health snapshot. Performs no I/O.
    pub fn health(&self) -> MeshHealth {
        let peers: Vec<PeerHealth> = self
            .links
            .links()
            .map(|link| PeerHealth {
                peer_id: link.peer_id().to_string(),
                state: link.state(),
                ever_opened: self.links.is_ever_opened(link.peer_id()),
            })
            .collect();

        MeshHealth {
            node_id: self.config.node_id.clone(),
            clock: self.clock,
            databases: self.stores.len(),
            peers_total: peers.len(),
            peers_open: self.links.open_count(),
            peers_live: self.links.live_count(),
            peers,
        }
    }
}
