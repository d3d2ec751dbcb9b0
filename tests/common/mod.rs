//! Shared test utilities for integration, chaos and property tests.
//!
//! This module provides:
//! - `Mesh`: engines on one `ChannelNetwork`, driven synchronously
//! - Listener log helpers

#![allow(dead_code)]

use mesh_replication::transport::channel::EventReceiver;
use mesh_replication::{
    ChannelNetwork, ChannelTransport, EventKind, Listener, MemoryStorage, ReplicationConfig,
    ReplicationEngine,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::sync::{Arc, Mutex};

pub type TestEngine = ReplicationEngine<ChannelTransport, MemoryStorage, StdRng>;

/// Upper bound on events delivered by one `exchange_messages` call.
const MAX_EVENTS_PER_EXCHANGE: usize = 100_000;

struct MeshNode {
    id: String,
    engine: TestEngine,
    events: EventReceiver,
    storage: MemoryStorage,
}

/// A set of engines sharing a channel network.
///
/// Nothing is delivered until `exchange_messages` runs, so tests control
/// exactly when the network makes progress.
pub struct Mesh {
    network: ChannelNetwork,
    nodes: Vec<MeshNode>,
    seed: u64,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            network: ChannelNetwork::new(),
            nodes: Vec::new(),
            seed: 42,
        }
    }

    pub fn network(&self) -> &ChannelNetwork {
        &self.network
    }

    /// Add a clean-start node with in-memory storage.
    pub fn add_node(&mut self, id: &str) -> &mut TestEngine {
        self.add_node_with(ReplicationConfig::for_testing(id), MemoryStorage::new())
    }

    /// Add a node with explicit config and storage.
    pub fn add_node_with(&mut self, config: ReplicationConfig, storage: MemoryStorage) -> &mut TestEngine {
        let id = config.node_id.clone();
        let (transport, events) = self.network.register(id.clone());
        self.seed += 1;
        let engine = ReplicationEngine::new(config, transport, storage.clone(), StdRng::seed_from_u64(self.seed))
            .expect("valid test config");
        self.nodes.push(MeshNode {
            id,
            engine,
            events,
            storage,
        });
        let last = self.nodes.len() - 1;
        &mut self.nodes[last].engine
    }

    /// Stop a node: drop its engine and leave the network. Returns its storage.
    pub fn remove_node(&mut self, id: &str) -> MemoryStorage {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .unwrap_or_else(|| panic!("unknown node {}", id));
        let node = self.nodes.remove(index);
        self.network.disconnect(id);
        node.storage
    }

    pub fn node(&self, id: &str) -> &TestEngine {
        &self
            .nodes
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("unknown node {}", id))
            .engine
    }

    pub fn node_mut(&mut self, id: &str) -> &mut TestEngine {
        &mut self
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("unknown node {}", id))
            .engine
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Deliver queued transport events until every queue is empty.
    /// Returns the number of events delivered.
    pub fn exchange_messages(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            for node in &mut self.nodes {
                while let Ok(event) = node.events.try_recv() {
                    node.engine.handle_transport_event(event);
                    delivered += 1;
                    progressed = true;
                    assert!(
                        delivered < MAX_EVENTS_PER_EXCHANGE,
                        "message exchange did not settle"
                    );
                }
            }
            if !progressed {
                return delivered;
            }
        }
    }

    /// Every node holds `value` under `db`/`id`.
    pub fn all_have(&self, db: &str, id: &str, value: &Value) -> bool {
        self.nodes.iter().all(|n| n.engine.get(db, id) == Some(value))
    }
}

/// Shared listener log.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// Listener appending `"<prefix> <id>,<json>"` to `log`.
pub fn log_listener(log: &Log, prefix: &str) -> Listener {
    let log = Arc::clone(log);
    let prefix = prefix.to_string();
    Arc::new(move |id: &str, value: &Value| {
        log.lock().unwrap().push(format!("{} {},{}", prefix, id, value));
    })
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub const ACCEPTED: [EventKind; 2] = [EventKind::Added, EventKind::Updated];
