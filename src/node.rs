// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async runtime for one replica.
//!
//! A [`ReplicaNode`] owns a [`ReplicationEngine`] on a single tokio task, so
//! API calls and transport notifications are applied one at a time in
//! arrival order:
//!
//! ```text
//!   ReplicaNode handle ── Command (mpsc + oneshot reply) ──┐
//!   Transport ─────────── TransportEvent (mpsc) ───────────┤
//!   liveness interval ─────────────────────────────────────┼─► select! ─► engine
//!   shutdown (watch) ──────────────────────────────────────┘
//! ```
//!
//! The periodic liveness pass makes a quiet node notice lost links; the
//! engine also runs one before each local write.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> mesh_replication::Result<()> {
//! use mesh_replication::{ChannelNetwork, ReplicaNode, ReplicationConfig};
//! use serde_json::json;
//!
//! let network = ChannelNetwork::new();
//! let mut a = ReplicaNode::start(ReplicationConfig::for_testing("a"), &network).await?;
//! let mut b = ReplicaNode::start(ReplicationConfig::for_testing("b"), &network).await?;
//!
//! a.connect_to_node("b").await?;
//! a.put("docs", "x", json!(["a", "b"])).await?;
//!
//! a.shutdown().await;
//! b.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{LivenessConfig, ReplicationConfig, StorageBackend};
use crate::coordinator::{MeshHealth, NodeState, ReplicationEngine};
use crate::error::{ReplicationError, Result};
use crate::events::{EventKind, Listener};
use crate::metrics;
use crate::packet::PeerId;
use crate::registry::LivenessReport;
use crate::storage::{MemoryStorage, Persistence, SqliteStorage};
use crate::transport::channel::ChannelNetwork;
use crate::transport::{Transport, TransportEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

const COMMAND_QUEUE_CAPACITY: usize = 1024;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

enum Command {
    Put {
        db: String,
        id: String,
        value: Value,
        reply: oneshot::Sender<EventKind>,
    },
    Add {
        db: String,
        value: Value,
        reply: oneshot::Sender<String>,
    },
    Get {
        db: String,
        id: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    On {
        kinds: Vec<EventKind>,
        db: String,
        replay: bool,
        listener: Listener,
        reply: oneshot::Sender<()>,
    },
    Health {
        reply: oneshot::Sender<MeshHealth>,
    },
    CheckConnections {
        reply: oneshot::Sender<LivenessReport>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::Add { .. } => "add",
            Command::Get { .. } => "get",
            Command::Connect { .. } => "connect_to_node",
            Command::On { .. } => "on",
            Command::Health { .. } => "health",
            Command::CheckConnections { .. } => "check_connections",
        }
    }
}

/// Handle to a running replica.
pub struct ReplicaNode {
    node_id: PeerId,
    commands: mpsc::Sender<Command>,
    state_tx: watch::Sender<NodeState>,
    state_rx: watch::Receiver<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    network: Option<ChannelNetwork>,
}

impl ReplicaNode {
    /// Join `network` and start a node with the configured storage backend.
    pub async fn start(config: ReplicationConfig, network: &ChannelNetwork) -> Result<Self> {
        config.validate()?;

        let node_id = config.node_id.clone();
        let (transport, events) = network.register(node_id.clone());
        let rng = StdRng::from_entropy();

        let mut node = match config.storage.backend {
            StorageBackend::Memory => {
                let engine = match ReplicationEngine::new(config, transport, MemoryStorage::new(), rng) {
                    Ok(engine) => engine,
                    Err(e) => {
                        network.disconnect(&node_id);
                        return Err(e);
                    }
                };
                Self::spawn(engine, events)
            }
            StorageBackend::Sqlite => {
                let storage =
                    match SqliteStorage::open(&config.storage.sqlite_path, config.storage.wal_mode).await {
                        Ok(storage) => storage,
                        Err(e) => {
                            network.disconnect(&node_id);
                            return Err(e);
                        }
                    };
                let flush_interval = config.storage.flush_interval_duration();
                let engine = match ReplicationEngine::new(config, transport, storage.clone(), rng) {
                    Ok(engine) => engine,
                    Err(e) => {
                        storage.close().await;
                        network.disconnect(&node_id);
                        return Err(e);
                    }
                };
                let mut node = Self::spawn(engine, events);
                let flush = storage.spawn_flush_task(flush_interval, node.shutdown_tx.subscribe());
                node.handles.push(flush);
                node
            }
        };

        node.network = Some(network.clone());
        Ok(node)
    }

    /// Drive an already constructed engine on a new task.
    ///
    /// `events` must be the receiving end of the engine transport's
    /// notification channel.
    pub fn spawn<T, P, R>(
        engine: ReplicationEngine<T, P, R>,
        events: mpsc::UnboundedReceiver<TransportEvent<T::Link>>,
    ) -> Self
    where
        T: Transport + Send + 'static,
        T::Link: Send,
        P: Persistence + Send + 'static,
        R: Rng + Send + 'static,
    {
        let node_id = engine.node_id().to_string();
        let liveness = engine.config().liveness.clone();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(NodeState::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let span = info_span!("replica", node_id = %node_id);
        let handle = tokio::spawn(
            run_node(engine, commands_rx, events, liveness, shutdown_rx).instrument(span),
        );

        let _ = state_tx.send(NodeState::Running);
        metrics::set_node_state("Running");

        Self {
            node_id,
            commands: commands_tx,
            state_tx,
            state_rx,
            shutdown_tx,
            handles: vec![handle],
            network: None,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ReplicationError::Shutdown)?;
        response.await.map_err(|_| ReplicationError::Shutdown)
    }

    pub async fn put(&self, db: &str, id: &str, value: Value) -> Result<EventKind> {
        self.request(|reply| Command::Put {
            db: db.to_string(),
            id: id.to_string(),
            value,
            reply,
        })
        .await
    }

    /// Write under a generated id; returns the id.
    pub async fn add(&self, db: &str, value: Value) -> Result<String> {
        self.request(|reply| Command::Add {
            db: db.to_string(),
            value,
            reply,
        })
        .await
    }

    pub async fn get(&self, db: &str, id: &str) -> Result<Option<Value>> {
        self.request(|reply| Command::Get {
            db: db.to_string(),
            id: id.to_string(),
            reply,
        })
        .await
    }

    pub async fn connect_to_node(&self, peer: &str) -> Result<()> {
        self.request(|reply| Command::Connect {
            peer: peer.to_string(),
            reply,
        })
        .await
    }

    /// Register a listener. It runs on the node task, so it must not block.
    pub async fn on<F>(&self, kinds: &[EventKind], db: &str, replay: bool, listener: F) -> Result<()>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.request(|reply| Command::On {
            kinds: kinds.to_vec(),
            db: db.to_string(),
            replay,
            listener,
            reply,
        })
        .await
    }

    pub async fn health(&self) -> Result<MeshHealth> {
        self.request(|reply| Command::Health { reply }).await
    }

    /// Run a liveness pass now instead of waiting for the timer.
    pub async fn check_connections(&self) -> Result<LivenessReport> {
        self.request(|reply| Command::CheckConnections { reply }).await
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    /// Stop the node.
    ///
    /// Shutdown sequence:
    /// 1. Signal the node task (and the storage flush task) to stop
    /// 2. Wait for them to finish (with timeout); SQLite storage is flushed
    /// 3. Leave the channel network so peers see the links close
    pub async fn shutdown(&mut self) {
        if self.state() == NodeState::Stopped {
            return;
        }
        info!(node_id = %self.node_id, "Shutting down replica");
        let _ = self.state_tx.send(NodeState::ShuttingDown);
        metrics::set_node_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        for (i, handle) in std::mem::take(&mut self.handles).into_iter().enumerate() {
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Some(network) = self.network.take() {
            network.disconnect(&self.node_id);
        }

        let _ = self.state_tx.send(NodeState::Stopped);
        metrics::set_node_state("Stopped");
        info!(node_id = %self.node_id, "Replica stopped");
    }
}

async fn run_node<T, P, R>(
    mut engine: ReplicationEngine<T, P, R>,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransportEvent<T::Link>>,
    liveness: LivenessConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    T: Transport,
    P: Persistence,
    R: Rng,
{
    let mut timer = tokio::time::interval(liveness.check_interval_duration());
    // The first tick completes immediately.
    timer.tick().await;

    info!(
        liveness = liveness.enabled,
        check_interval = %liveness.check_interval,
        "Replica running"
    );

    loop {
        tokio::select! {
            Some(command) = commands.recv() => {
                let name = command.name();
                let start = Instant::now();
                apply(&mut engine, command);
                metrics::record_command_latency(name, start.elapsed());
            }
            Some(event) = events.recv() => {
                engine.handle_transport_event(event);
            }
            _ = timer.tick(), if liveness.enabled => {
                let report = engine.check_connections();
                if report.changed() {
                    debug!(
                        pruned = report.pruned.len(),
                        reconnected = ?report.reconnected,
                        "Periodic liveness pass"
                    );
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Replica task stopping");
                    break;
                }
            }
            else => break,
        }
    }
}

fn apply<T: Transport, P: Persistence, R: Rng>(engine: &mut ReplicationEngine<T, P, R>, command: Command) {
    // A dropped reply receiver means the caller went away; nothing to do.
    match command {
        Command::Put { db, id, value, reply } => {
            let _ = reply.send(engine.put(&db, &id, value));
        }
        Command::Add { db, value, reply } => {
            let _ = reply.send(engine.add(&db, value));
        }
        Command::Get { db, id, reply } => {
            let _ = reply.send(engine.get(&db, &id).cloned());
        }
        Command::Connect { peer, reply } => {
            engine.connect_to_node(&peer);
            let _ = reply.send(());
        }
        Command::On {
            kinds,
            db,
            replay,
            listener,
            reply,
        } => {
            engine.on(&kinds, &db, replay, listener);
            let _ = reply.send(());
        }
        Command::Health { reply } => {
            let _ = reply.send(engine.health());
        }
        Command::CheckConnections { reply } => {
            let _ = reply.send(engine.check_connections());
        }
    }
}
