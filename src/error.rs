// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication layer.
//!
//! The replication core itself never fails towards its caller: stale writes
//! are classified as `Ignored`, dead links are pruned, and unreadable
//! snapshots degrade to "no prior data". Errors in this module describe
//! those degradations (so they can be logged with context) and the few
//! places where a hard failure is real: opening or flushing SQLite storage,
//! invalid configuration, and talking to a node that has shut down.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Storage` | Yes | SQLite errors while loading or flushing snapshots |
//! | `Transport` | Yes | Link could not be opened or was lost |
//! | `Config` | No | Configuration invalid |
//! | `Snapshot` | No | Persisted snapshot or metadata is malformed |
//! | `Shutdown` | No | Node is shutting down |
//! | `Internal` | No | Unexpected internal error |

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur around the replication core.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// SQLite error in the snapshot store.
    ///
    /// Usually lock contention or I/O pressure; the write-behind cache keeps
    /// the data and the next flush retries.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A persisted snapshot or metadata entry could not be decoded.
    ///
    /// Never propagated out of the engine: the entry is treated as absent.
    #[error("Malformed snapshot ({key}): {message}")]
    Snapshot { key: String, message: String },

    /// A link to a peer could not be opened or failed.
    #[error("Transport error ({peer_id}): {message}")]
    Transport { peer_id: String, message: String },

    /// The node runtime has stopped and no longer accepts commands.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a snapshot error for a storage key.
    pub fn snapshot(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Snapshot {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a transport error for a peer.
    pub fn transport(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            Self::Transport { .. } => true,
            Self::Config(_) => false,
            Self::Snapshot { .. } => false, // Data corruption
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_storage() {
        let err = ReplicationError::Storage(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Storage error"));
    }

    #[test]
    fn test_is_retryable_transport() {
        let err = ReplicationError::transport("peer-1", "peer not reachable");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("peer-1"));
        assert!(err.to_string().contains("peer not reachable"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("empty node id".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_snapshot() {
        let err = ReplicationError::snapshot("dbs.docs", "expected value at line 1");
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("dbs.docs"));
        assert!(msg.contains("expected value"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        let err = ReplicationError::Shutdown;
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_internal() {
        let err = ReplicationError::Internal("engine task panicked".to_string());
        assert!(!err.is_retryable());
    }
}
