// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence collaborator.
//!
//! The engine treats storage as a string key/value surface: it reads once at
//! startup and writes through after every accepted change. Keys are derived
//! from the instance name `S`:
//!
//! ```text
//! S.<dbName>              {"times": {id: n}, "data": {id: value}, "origins": {id: peer}}
//! S.meta.knownDatabases   ["docs", "todos"]
//! S.meta.knownPeerIds     ["user2", "user3"]
//! ```
//!
//! Two backends ship with the crate: [`MemoryStorage`] and
//! [`sqlite::SqliteStorage`] (write-behind over SQLite).

pub mod sqlite;

use crate::error::{ReplicationError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub use sqlite::SqliteStorage;

/// Key/value persistence used by the engine.
///
/// Implementations must be synchronous: the replication pipeline runs to
/// completion without yielding. Backends that talk to slow media buffer
/// writes and flush them elsewhere (see [`SqliteStorage`]).
pub trait Persistence {
    /// Read a value, `None` if absent.
    fn read(&self, key: &str) -> Option<String>;

    /// Write (insert or replace) a value.
    fn write(&mut self, key: &str, value: String);

    /// Remove a value. Removing an absent key is a no-op.
    fn delete(&mut self, key: &str);
}

/// Storage key layout for one instance namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    instance: String,
}

impl StorageKeys {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Snapshot key for a database.
    pub fn snapshot(&self, database: &str) -> String {
        format!("{}.{}", self.instance, database)
    }

    pub fn known_databases(&self) -> String {
        format!("{}.meta.knownDatabases", self.instance)
    }

    pub fn known_peer_ids(&self) -> String {
        format!("{}.meta.knownPeerIds", self.instance)
    }
}

/// Decode a JSON string array stored under `key`.
///
/// Absent keys decode to an empty list; malformed values are reported as
/// [`ReplicationError::Snapshot`].
pub fn read_string_list<P: Persistence + ?Sized>(storage: &P, key: &str) -> Result<Vec<String>> {
    match storage.read(key) {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(&raw).map_err(|e| ReplicationError::snapshot(key, e)),
    }
}

/// Encode `items` as a JSON string array under `key`.
pub fn write_string_list<P: Persistence + ?Sized>(storage: &mut P, key: &str, items: &[String]) {
    // Serializing a slice of strings cannot fail.
    let encoded = serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string());
    storage.write(key, encoded);
}

/// In-memory storage.
///
/// Clones share the same underlying map, so a test can drop an engine and
/// start a new one on the "same disk".
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Persistence for MemoryStorage {
    fn read(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    fn write(&mut self, key: &str, value: String) {
        self.entries().insert(key.to_string(), value);
    }

    fn delete(&mut self, key: &str) {
        self.entries().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_keys_layout() {
        let keys = StorageKeys::new("dbs");
        assert_eq!(keys.instance(), "dbs");
        assert_eq!(keys.snapshot("docs"), "dbs.docs");
        assert_eq!(keys.known_databases(), "dbs.meta.knownDatabases");
        assert_eq!(keys.known_peer_ids(), "dbs.meta.knownPeerIds");
    }

    #[test]
    fn test_memory_storage_basic() {
        let mut storage = MemoryStorage::new();
        assert!(storage.is_empty());
        assert!(storage.read("a").is_none());

        storage.write("a", "1".to_string());
        storage.write("a", "2".to_string());
        assert_eq!(storage.read("a"), Some("2".to_string()));
        assert_eq!(storage.len(), 1);

        storage.delete("a");
        storage.delete("missing");
        assert!(storage.read("a").is_none());
    }

    #[test]
    fn test_memory_storage_clones_share_state() {
        let mut first = MemoryStorage::new();
        let second = first.clone();
        first.write("k", "v".to_string());
        assert_eq!(second.read("k"), Some("v".to_string()));
        assert_eq!(second.keys(), vec!["k".to_string()]);
    }

    #[test]
    fn test_string_list_roundtrip_and_absent() {
        let mut storage = MemoryStorage::new();
        assert!(read_string_list(&storage, "list").unwrap().is_empty());

        write_string_list(&mut storage, "list", &["x".to_string(), "y".to_string()]);
        assert_eq!(storage.read("list"), Some(r#"["x","y"]"#.to_string()));
        assert_eq!(read_string_list(&storage, "list").unwrap(), vec!["x", "y"]);
    }

    #[test]
    fn test_string_list_malformed() {
        let mut storage = MemoryStorage::new();
        storage.write("list", "{not json".to_string());
        let err = read_string_list(&storage, "list").unwrap_err();
        assert!(matches!(err, ReplicationError::Snapshot { ref key, .. } if key == "list"));
    }
}
