// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named collection of timestamped records.
//!
//! A [`KeyedStore`] holds at most one [`Record`] per id. Writes are merged
//! with a last-write-wins rule: an incoming write replaces the stored one only
//! if its [`Stamp`] supersedes the stored stamp under the configured
//! [`ConflictPolicy`]. Every accepted write persists the full snapshot.
//!
//! # Snapshot Format
//!
//! ```json
//! {"times": {"x": 4}, "data": {"x": ["a", "b"]}, "origins": {"x": "user1"}}
//! ```
//!
//! `origins` is optional on load; records without one get an empty origin,
//! which loses every tie against a real node id.

use crate::error::ReplicationError;
use crate::events::EventKind;
use crate::metrics;
use crate::packet::{PeerId, Stamp};
use crate::storage::Persistence;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// How two writes with the same id are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Accept only a strictly greater time. Equal times keep whichever write
    /// arrived first, so nodes may disagree after a collision.
    StrictTime,
    /// Compare `(time, origin)` lexicographically. Every node picks the same
    /// winner for colliding times.
    #[default]
    TimeThenOrigin,
}

impl ConflictPolicy {
    /// Whether `incoming` replaces `stored`.
    pub fn supersedes(&self, incoming: &Stamp, stored: &Stamp) -> bool {
        match self {
            Self::StrictTime => incoming.time > stored.time,
            Self::TimeThenOrigin => incoming.cmp_with_origin(stored) == Ordering::Greater,
        }
    }
}

/// One stored value with its write stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub time: u64,
    pub origin: PeerId,
    pub value: Value,
}

impl Record {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.time, self.origin.clone())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    times: IndexMap<String, u64>,
    data: IndexMap<String, Value>,
    #[serde(default)]
    origins: IndexMap<String, PeerId>,
}

/// A single named database.
#[derive(Debug)]
pub struct KeyedStore {
    name: String,
    storage_key: String,
    policy: ConflictPolicy,
    records: IndexMap<String, Record>,
}

impl KeyedStore {
    /// Open the store, loading its snapshot from `storage` if one exists.
    ///
    /// A snapshot that cannot be decoded is logged and treated as absent.
    pub fn open<P: Persistence + ?Sized>(
        name: impl Into<String>,
        storage_key: impl Into<String>,
        policy: ConflictPolicy,
        storage: &P,
    ) -> Self {
        let name = name.into();
        let storage_key = storage_key.into();

        let records = match storage.read(&storage_key) {
            None => IndexMap::new(),
            Some(raw) => match Self::decode(&storage_key, &raw) {
                Ok(records) => {
                    debug!(db = %name, count = records.len(), "Loaded snapshot");
                    records
                }
                Err(e) => {
                    warn!(db = %name, error = %e, "Ignoring unreadable snapshot");
                    metrics::record_snapshot_load_failure(&storage_key);
                    IndexMap::new()
                }
            },
        };

        Self {
            name,
            storage_key,
            policy,
            records,
        }
    }

    fn decode(key: &str, raw: &str) -> Result<IndexMap<String, Record>, ReplicationError> {
        let mut snapshot: StoreSnapshot =
            serde_json::from_str(raw).map_err(|e| ReplicationError::snapshot(key, e))?;

        let mut records = IndexMap::with_capacity(snapshot.times.len());
        for (id, time) in snapshot.times {
            let value = snapshot.data.swap_remove(&id).unwrap_or(Value::Null);
            let origin = snapshot.origins.swap_remove(&id).unwrap_or_default();
            records.insert(id, Record { time, origin, value });
        }
        Ok(records)
    }

    fn encode(&self) -> String {
        let mut snapshot = StoreSnapshot::default();
        for (id, record) in &self.records {
            snapshot.times.insert(id.clone(), record.time);
            snapshot.data.insert(id.clone(), record.value.clone());
            snapshot.origins.insert(id.clone(), record.origin.clone());
        }
        // Maps of strings to JSON values always serialize.
        serde_json::to_string(&snapshot).unwrap_or_default()
    }

    /// Merge a write. Returns how the store changed.
    pub fn put<P: Persistence + ?Sized>(
        &mut self,
        id: &str,
        stamp: Stamp,
        value: Value,
        storage: &mut P,
    ) -> EventKind {
        let kind = match self.records.get_mut(id) {
            None => {
                self.records.insert(
                    id.to_string(),
                    Record {
                        time: stamp.time,
                        origin: stamp.origin,
                        value,
                    },
                );
                EventKind::Added
            }
            Some(existing) => {
                if !self.policy.supersedes(&stamp, &existing.stamp()) {
                    return EventKind::Ignored;
                }
                existing.time = stamp.time;
                existing.origin = stamp.origin;
                existing.value = value;
                EventKind::Updated
            }
        };

        storage.write(&self.storage_key, self.encode());
        metrics::record_snapshot_persisted(&self.name);
        kind
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.records.get(id).map(|r| &r.value)
    }

    pub fn record(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// Visit every `(id, value)` pair in insertion order.
    pub fn for_each(&self, mut visitor: impl FnMut(&str, &Value)) {
        for (id, record) in &self.records {
            visitor(id, &record.value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.records.iter().map(|(id, r)| (id.as_str(), r))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
