//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Packet flow (received by outcome, forwarded, dumped)
//! - Link lifecycle (opened, errored, pruned, reconnect fallbacks)
//! - Snapshot persistence (persists, load failures, SQLite flushes)
//! - Node runtime state and command latency
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mesh_replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! The crate only records through the `metrics` facade; installing an
//! exporter is up to the application.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mesh_replication::metrics;
//!
//! metrics::record_packet_received("docs", "added");
//! metrics::record_packets_forwarded(2);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Packet Flow
// =============================================================================

/// Record an inbound packet and how it was merged.
pub fn record_packet_received(db: &str, outcome: &str) {
    counter!(
        "mesh_replication_packets_received_total",
        "db" => db.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an inbound packet dropped before merging.
pub fn record_packet_rejected(db: &str, reason: &str) {
    counter!(
        "mesh_replication_packets_rejected_total",
        "db" => db.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record packets forwarded to further receivers.
pub fn record_packets_forwarded(count: usize) {
    if count > 0 {
        counter!("mesh_replication_packets_forwarded_total").increment(count as u64);
    }
}

/// Record a locally originated write.
pub fn record_local_write(db: &str) {
    counter!("mesh_replication_local_writes_total", "db" => db.to_string()).increment(1);
}

/// Record records dumped to a freshly opened link.
pub fn record_dump_sent(peer_id: &str, entries: usize) {
    counter!("mesh_replication_dumps_total", "peer_id" => peer_id.to_string()).increment(1);
    counter!("mesh_replication_dump_entries_total", "peer_id" => peer_id.to_string())
        .increment(entries as u64);
}

/// Record links opened to peers learned from gossip.
pub fn record_topology_repair(count: usize) {
    if count > 0 {
        counter!("mesh_replication_topology_repairs_total").increment(count as u64);
    }
}

// =============================================================================
// Link Lifecycle
// =============================================================================

/// Record a link transition reported by the transport.
pub fn record_link_event(peer_id: &str, event: &str) {
    counter!(
        "mesh_replication_link_events_total",
        "peer_id" => peer_id.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record links dropped by a liveness pass.
pub fn record_links_pruned(count: usize) {
    counter!("mesh_replication_links_pruned_total").increment(count as u64);
}

/// Record the reconnect fallback firing.
pub fn record_reconnect_fallback() {
    counter!("mesh_replication_reconnect_fallbacks_total").increment(1);
}

/// Gauge for number of tracked peers.
pub fn set_known_peers(count: usize) {
    gauge!("mesh_replication_known_peers").set(count as f64);
}

/// Gauge for number of open links.
pub fn set_open_links(count: usize) {
    gauge!("mesh_replication_open_links").set(count as f64);
}

// =============================================================================
// Persistence
// =============================================================================

/// Record a full snapshot write.
pub fn record_snapshot_persisted(db: &str) {
    counter!("mesh_replication_snapshot_persists_total", "db" => db.to_string()).increment(1);
}

/// Record a snapshot or metadata entry that could not be decoded.
pub fn record_snapshot_load_failure(key: &str) {
    counter!("mesh_replication_snapshot_load_failures_total", "key" => key.to_string()).increment(1);
}

/// Record a write-behind flush.
pub fn record_storage_flush(flushed: usize, errors: usize) {
    counter!("mesh_replication_storage_flushes_total").increment(1);
    counter!("mesh_replication_storage_flushed_entries_total").increment(flushed as u64);
    if errors > 0 {
        counter!("mesh_replication_storage_flush_errors_total").increment(errors as u64);
    }
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_storage_retry(operation: &str) {
    counter!("mesh_replication_storage_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Node Runtime
// =============================================================================

/// Gauge for node runtime state.
pub fn set_node_state(state: &str) {
    let value = match state {
        "Starting" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("mesh_replication_node_state").set(value);
}

/// Record how long the node task spent on one API command.
pub fn record_command_latency(command: &str, duration: Duration) {
    histogram!("mesh_replication_command_duration_seconds", "command" => command.to_string())
        .record(duration.as_secs_f64());
}
