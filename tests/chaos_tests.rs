// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the engine handles unreachable peers, departed nodes,
//! corrupted persisted state and hostile packets without panics or loss of
//! local data.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{entries, log_listener, new_log, Mesh, ACCEPTED};
use mesh_replication::transport::Transport;
use mesh_replication::{
    EventKind, LinkState, MemoryStorage, Packet, Persistence, ReplicationConfig, SqliteStorage,
    TransportEvent, MAX_REMOTE_TIME,
};
use serde_json::json;
use tempfile::tempdir;

fn reload_config(id: &str) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(id);
    config.clean_start = false;
    config
}

// =============================================================================
// Unreachable Peers
// =============================================================================

/// Test: a peer that never answers is dropped on the next passes
#[test]
fn unreachable_peer_is_pruned() {
    let mut mesh = Mesh::new();
    mesh.add_node("user1").connect_to_node("ghost");
    mesh.exchange_messages();

    let dbs = mesh.node_mut("user1");
    assert_eq!(dbs.links().get("ghost").unwrap().state(), LinkState::Closed);

    let report = dbs.check_connections();
    assert_eq!(report.pruned, vec!["ghost"]);
    assert!(dbs.known_peer_ids().is_empty());
    assert_eq!(dbs.storage().read("dbs.meta.knownPeerIds"), Some("[]".to_string()));
}

/// Test: writes with no reachable peer still land locally
#[test]
fn writes_survive_departed_peer() {
    let mut mesh = Mesh::new();
    mesh.add_node("user1");
    mesh.add_node("user2");
    mesh.node_mut("user1").connect_to_node("user2");
    mesh.exchange_messages();

    mesh.remove_node("user2");
    mesh.exchange_messages();

    let dbs = mesh.node_mut("user1");
    assert_eq!(dbs.put("docs", "x", json!("alone")), EventKind::Added);
    assert_eq!(dbs.get("docs", "x"), Some(&json!("alone")));
}

/// Test: gossip naming an unknown node triggers a dial that later gets pruned
#[test]
fn gossip_naming_missing_node_is_pruned() {
    let mut mesh = Mesh::new();
    mesh.add_node("user1");
    mesh.add_node("user2");
    mesh.node_mut("user2").connect_to_node("user1");
    mesh.exchange_messages();

    mesh.node_mut("user1").handle_transport_event(TransportEvent::Data {
        from: "user2".into(),
        packet: Packet {
            src: "user2".into(),
            t: 3,
            rcv: vec!["user1".into(), "phantom".into()],
            db: "docs".into(),
            id: "x".into(),
            data: json!(1),
            origin: None,
        },
    });
    assert!(mesh.node("user1").links().contains("phantom"));
    mesh.exchange_messages();

    let report = mesh.node_mut("user1").check_connections();
    assert_eq!(report.pruned, vec!["phantom"]);
    assert_eq!(mesh.node("user1").known_peer_ids(), vec!["user2"]);
}

// =============================================================================
// Partitions and Reconnect
// =============================================================================

/// Test: after every link is lost the node keeps retrying a known-good peer
#[test]
fn reconnect_fallback_recovers_after_partition() {
    let mut mesh = Mesh::new();
    mesh.add_node("user1");
    mesh.add_node("user2");
    mesh.node_mut("user1").connect_to_node("user2");
    mesh.exchange_messages();

    // user2 drops off the rendezvous; user1 sees the link close.
    mesh.network().disconnect("user2");
    mesh.exchange_messages();
    assert_eq!(mesh.node("user1").health().peers_live, 0);

    // First fallback attempt fails while user2 is away.
    let report = mesh.node_mut("user1").check_connections();
    assert_eq!(report.reconnected.as_deref(), Some("user2"));
    assert!(report.pruned.is_empty());
    mesh.exchange_messages();
    assert_eq!(mesh.node("user1").links().get("user2").unwrap().state(), LinkState::Closed);

    // user2 notices it lost the rendezvous and rejoins.
    mesh.node_mut("user2").check_connections();
    assert!(mesh.network().is_registered("user2"));

    let report = mesh.node_mut("user1").check_connections();
    assert_eq!(report.reconnected.as_deref(), Some("user2"));
    mesh.exchange_messages();
    assert_eq!(mesh.node("user1").health().peers_open, 1);

    mesh.node_mut("user1").put("docs", "x", json!("healed"));
    mesh.exchange_messages();
    assert!(mesh.all_have("docs", "x", &json!("healed")));
}

/// Test: a node cut from the rendezvous rejoins before its next write
#[test]
fn write_rejoins_rendezvous() {
    let mut mesh = Mesh::new();
    mesh.add_node("user1");
    mesh.network().disconnect("user1");
    assert!(mesh.node("user1").transport().is_disconnected_from_rendezvous());

    mesh.node_mut("user1").put("docs", "x", json!(1));
    assert!(mesh.network().is_registered("user1"));
}

/// Test: data written on both sides of a partition merges once healed
#[test]
fn partitioned_writes_converge() {
    let mut mesh = Mesh::new();
    for id in ["user1", "user2", "user3"] {
        mesh.add_node(id);
    }
    mesh.node_mut("user2").connect_to_node("user1");
    mesh.node_mut("user3").connect_to_node("user1");
    mesh.exchange_messages();

    mesh.network().disconnect("user3");
    mesh.exchange_messages();

    mesh.node_mut("user1").put("docs", "shared", json!("from user1"));
    mesh.node_mut("user3").put("docs", "solo", json!("from user3"));
    mesh.node_mut("user3").put("docs", "shared", json!("from user3"));
    // user3's first write put it back on the rendezvous.
    mesh.exchange_messages();
    assert!(mesh.network().is_registered("user3"));

    assert!(mesh.all_have("docs", "solo", &json!("from user3")));
    // user3 wrote "shared" at time 1, user1 at time 0.
    assert!(mesh.all_have("docs", "shared", &json!("from user3")));
}

// =============================================================================
// Corrupted Persisted State
// =============================================================================

/// Test: a corrupted snapshot loads as empty and is overwritten on write
#[test]
fn corrupted_snapshot_no_panic() {
    let corrupted: &[&str] = &[
        "",
        "not json",
        "{",
        "[]",
        r#"{"times": "nope"}"#,
        r#"{"times": {"x": -1}, "data": {}}"#,
    ];

    for raw in corrupted {
        let mut storage = MemoryStorage::new();
        storage.write("dbs.meta.knownDatabases", r#"["docs"]"#.to_string());
        storage.write("dbs.docs", raw.to_string());

        let mut mesh = Mesh::new();
        let dbs = mesh.add_node_with(reload_config("user1"), storage.clone());
        assert_eq!(dbs.database_names(), vec!["docs"], "input: {:?}", raw);
        assert!(dbs.database("docs").unwrap().is_empty());

        dbs.put("docs", "x", json!(1));
        let reloaded: serde_json::Value = serde_json::from_str(&storage.read("dbs.docs").unwrap()).unwrap();
        assert_eq!(reloaded["times"]["x"], 0);
    }
}

/// Test: a snapshot missing its data entry keeps the id with a null value
#[test]
fn snapshot_without_data_entry() {
    let mut storage = MemoryStorage::new();
    storage.write("dbs.meta.knownDatabases", r#"["docs"]"#.to_string());
    storage.write("dbs.docs", r#"{"times": {"x": 4}, "data": {}}"#.to_string());

    let mut mesh = Mesh::new();
    let dbs = mesh.add_node_with(reload_config("user1"), storage);
    assert_eq!(dbs.get("docs", "x"), Some(&json!(null)));
    assert_eq!(dbs.database("docs").unwrap().record("x").unwrap().time, 4);
}

/// Test: corrupted registries are treated as absent
#[test]
fn corrupted_registries_no_panic() {
    let mut storage = MemoryStorage::new();
    storage.write("dbs.meta.knownDatabases", r#"{"docs": true}"#.to_string());
    storage.write("dbs.meta.knownPeerIds", "[1, 2, 3]".to_string());

    let mut mesh = Mesh::new();
    let dbs = mesh.add_node_with(reload_config("user1"), storage);
    assert!(dbs.database_names().is_empty());
    assert!(dbs.known_peer_ids().is_empty());
}

// =============================================================================
// Hostile Packets
// =============================================================================

/// Test: replayed and stale packets change nothing
#[test]
fn duplicate_and_stale_packets_are_ignored() {
    let mut mesh = Mesh::new();
    let log = new_log();
    let dbs = mesh.add_node("user1");
    dbs.on(&ACCEPTED, "docs", false, log_listener(&log, "accepted"));
    dbs.on(&[EventKind::Ignored], "docs", false, log_listener(&log, "ignored"));

    let packet = |t: u64, data: serde_json::Value| TransportEvent::Data {
        from: "user2".into(),
        packet: Packet {
            src: "user2".into(),
            t,
            rcv: vec!["user1".into()],
            db: "docs".into(),
            id: "x".into(),
            data,
            origin: None,
        },
    };

    dbs.handle_transport_event(packet(5, json!("v5")));
    dbs.handle_transport_event(packet(5, json!("v5")));
    dbs.handle_transport_event(packet(2, json!("v2")));

    assert_eq!(dbs.get("docs", "x"), Some(&json!("v5")));
    assert_eq!(
        entries(&log),
        vec![r#"accepted x,"v5""#, r#"ignored x,"v5""#, r#"ignored x,"v2""#]
    );
}

/// Test: a packet that lists this node as source does not dial itself
#[test]
fn packet_from_self_does_not_self_connect() {
    let mut mesh = Mesh::new();
    let dbs = mesh.add_node("user1");
    dbs.handle_transport_event(TransportEvent::Data {
        from: "user1".into(),
        packet: Packet {
            src: "user1".into(),
            t: 0,
            rcv: vec!["user1".into(), "user1".into()],
            db: "docs".into(),
            id: "x".into(),
            data: json!(1),
            origin: None,
        },
    });
    assert!(dbs.known_peer_ids().is_empty());
}

/// Test: close notifications for untracked peers are harmless; an open
/// notification dials back, and the failed dial is pruned
#[test]
fn notifications_for_unknown_peers() {
    let mut mesh = Mesh::new();
    let dbs = mesh.add_node("user1");
    dbs.handle_transport_event(TransportEvent::Closed("stranger".into()));
    dbs.handle_transport_event(TransportEvent::Errored {
        peer: "stranger".into(),
        reason: "boom".into(),
    });
    assert_eq!(dbs.health().peers_total, 0);

    dbs.handle_transport_event(TransportEvent::Opened("stranger".into()));
    assert_eq!(dbs.known_peer_ids(), vec!["stranger"]);
    mesh.exchange_messages();

    let report = mesh.node_mut("user1").check_connections();
    assert_eq!(report.pruned, vec!["stranger"]);
    assert!(mesh.node("user1").known_peer_ids().is_empty());
}

/// Test: a packet stamped near the end of the time range is dropped and
/// later writes still replicate
#[test]
fn out_of_range_time_is_rejected() {
    let mut mesh = Mesh::new();
    mesh.add_node("user1");
    mesh.add_node("user2");
    mesh.node_mut("user2").connect_to_node("user1");
    mesh.exchange_messages();

    let dbs = mesh.node_mut("user1");
    dbs.handle_transport_event(TransportEvent::Data {
        from: "user2".into(),
        packet: Packet {
            src: "user2".into(),
            t: u64::MAX,
            rcv: vec!["user1".into()],
            db: "docs".into(),
            id: "x".into(),
            data: json!("hostile"),
            origin: None,
        },
    });
    assert_eq!(dbs.clock(), 0);
    assert_eq!(dbs.get("docs", "x"), None);

    assert_eq!(dbs.put("docs", "x", json!("mine")), EventKind::Added);
    assert_eq!(dbs.put("docs", "x", json!("newer")), EventKind::Updated);
    mesh.exchange_messages();
    assert!(mesh.all_have("docs", "x", &json!("newer")));
}

/// Test: the largest accepted time still leaves room for local writes
#[test]
fn max_remote_time_keeps_clock_usable() {
    let mut mesh = Mesh::new();
    mesh.add_node("user1");
    mesh.add_node("user2");
    mesh.node_mut("user1").connect_to_node("user2");
    mesh.exchange_messages();

    mesh.node_mut("user2").handle_transport_event(TransportEvent::Data {
        from: "user1".into(),
        packet: Packet {
            src: "user1".into(),
            t: MAX_REMOTE_TIME,
            rcv: vec!["user2".into()],
            db: "docs".into(),
            id: "x".into(),
            data: json!("edge"),
            origin: None,
        },
    });
    assert_eq!(mesh.node("user2").clock(), MAX_REMOTE_TIME);

    // user2 wins the tie at the edge time, then moves past it.
    let dbs = mesh.node_mut("user2");
    assert_eq!(dbs.put("docs", "x", json!("a")), EventKind::Updated);
    assert_eq!(dbs.put("docs", "x", json!("b")), EventKind::Updated);
    assert_eq!(dbs.clock(), MAX_REMOTE_TIME + 2);
    assert_eq!(dbs.get("docs", "x"), Some(&json!("b")));
}

// =============================================================================
// SQLite Storage
// =============================================================================

/// Test: snapshots written through the cache survive a reopen
#[tokio::test]
async fn sqlite_snapshots_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("replica.db");

    let mut storage = SqliteStorage::open(&path, true).await.unwrap();
    storage.write("dbs.meta.knownDatabases", r#"["docs"]"#.to_string());
    storage.write("dbs.docs", r#"{"times":{"x":2},"data":{"x":"kept"}}"#.to_string());
    storage.write("dbs.scratch", "gone".to_string());
    storage.delete("dbs.scratch");
    storage.close().await;

    let storage = SqliteStorage::open(&path, true).await.unwrap();
    assert_eq!(storage.read("dbs.scratch"), None);
    assert_eq!(storage.read("dbs.meta.knownDatabases"), Some(r#"["docs"]"#.to_string()));
    storage.close().await;
}

/// Test: garbage rows in SQLite degrade to an empty store
#[tokio::test]
async fn sqlite_corrupted_row_no_panic() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("replica.db");

    let mut storage = SqliteStorage::open(&path, false).await.unwrap();
    storage.write("dbs.meta.knownDatabases", r#"["docs"]"#.to_string());
    storage.write("dbs.docs", "garbage{".to_string());
    storage.flush_dirty().await.unwrap();
    storage.close().await;

    let storage = SqliteStorage::open(&path, false).await.unwrap();
    let store = mesh_replication::KeyedStore::open(
        "docs",
        "dbs.docs",
        mesh_replication::ConflictPolicy::default(),
        &storage,
    );
    assert!(store.is_empty());
    storage.close().await;
}
