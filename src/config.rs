//! Configuration for a replica node.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! or [`ReplicaNode::start()`](crate::ReplicaNode::start) and can be constructed
//! programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use mesh_replication::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     node_id: "user1".into(),
//!     instance_name: "dbs".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── node_id: String              # This node's peer id
//! ├── instance_name: String        # Storage namespace ("S" in S.<db>)
//! ├── clean_start: bool            # Erase the namespace instead of loading it
//! ├── conflict_policy              # time_then_origin | strict_time
//! ├── liveness: LivenessConfig     # Periodic pruning / reconnect
//! └── storage: StorageConfig       # memory | sqlite snapshot backend
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "user1"
//! instance_name: "dbs"
//! conflict_policy: time_then_origin
//!
//! liveness:
//!   check_interval: "5s"
//!
//! storage:
//!   backend: sqlite
//!   sqlite_path: "/var/lib/app/replica.db"
//!   flush_interval: "1s"
//! ```

use crate::error::{ReplicationError, Result};
use crate::store::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// This node's identity in the mesh.
    pub node_id: String,

    /// Prefix of every storage key this node reads or writes.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Erase all persisted state in the namespace at startup.
    #[serde(default)]
    pub clean_start: bool,

    /// Ordering rule for writes to the same id.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.node.default".to_string(),
            instance_name: default_instance_name(),
            clean_start: false,
            conflict_policy: ConflictPolicy::default(),
            liveness: LivenessConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: clean start, in-memory storage.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            instance_name: default_instance_name(),
            clean_start: true,
            conflict_policy: ConflictPolicy::default(),
            liveness: LivenessConfig::default(),
            storage: StorageConfig::in_memory(),
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(ReplicationError::Config("node_id must not be empty".to_string()));
        }
        if self.instance_name.trim().is_empty() {
            return Err(ReplicationError::Config(
                "instance_name must not be empty".to_string(),
            ));
        }
        parse_interval("liveness.check_interval", &self.liveness.check_interval)?;
        parse_interval("storage.flush_interval", &self.storage.flush_interval)?;
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.is_empty() {
            return Err(ReplicationError::Config(
                "storage.sqlite_path is required for the sqlite backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a non-zero humantime interval.
fn parse_interval(field: &str, value: &str) -> Result<Duration> {
    match humantime::parse_duration(value) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(ReplicationError::Config(format!("invalid {}: {:?}", field, value))),
    }
}

fn default_instance_name() -> String {
    "dbs".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// LivenessConfig: link pruning and reconnect fallback
// ═══════════════════════════════════════════════════════════════════════════════

/// Link liveness settings.
///
/// A liveness pass always runs before each local write. With `enabled` set,
/// the node runtime also runs one every `check_interval` so a quiet node
/// still notices it lost all its links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Run periodic liveness passes (node runtime only).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between periodic passes (e.g., "5s", "1m").
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> String {
    "5s".to_string()
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_check_interval(),
        }
    }
}

impl LivenessConfig {
    /// Parse the check interval as a Duration.
    pub fn check_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.check_interval).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig: snapshot persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Where snapshots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process memory; lost on exit.
    #[default]
    Memory,
    /// SQLite file with a write-behind cache.
    Sqlite,
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Path to the SQLite database (sqlite backend only).
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How often dirty snapshot entries are flushed (e.g., "1s").
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_sqlite_path() -> String {
    "replica.db".to_string()
}

fn default_flush_interval() -> String {
    "1s".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
            flush_interval: default_flush_interval(),
        }
    }
}

impl StorageConfig {
    /// In-memory storage for testing.
    pub fn in_memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            ..Default::default()
        }
    }

    /// SQLite storage at `path`.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: path.into(),
            ..Default::default()
        }
    }

    /// Parse the flush interval as a Duration.
    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
