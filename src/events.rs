// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change notifications.
//!
//! Listeners are registered per `(EventKind, database)` and called
//! synchronously, in registration order, from inside the replication
//! pipeline. There is no unsubscribe.

use crate::store::KeyedStore;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Outcome of merging a write into a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The id was not present before.
    Added,
    /// A newer write replaced the stored value.
    Updated,
    /// The write was not newer and was discarded.
    Ignored,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Added, EventKind::Updated, EventKind::Ignored];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Ignored => "ignored",
        }
    }

    /// Whether the store changed.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked with `(id, value)`.
pub type Listener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Registry of listeners keyed by event kind and database name.
#[derive(Default)]
pub struct EventRouter {
    listeners: HashMap<EventKind, IndexMap<String, Vec<Listener>>>,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("listeners", &self.total_listeners())
            .finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` once per kind in `kinds`, in that order.
    ///
    /// With `replay` set, every record already in the store is delivered to
    /// the listener right after each registration.
    pub fn subscribe(
        &mut self,
        kinds: &[EventKind],
        database: &str,
        replay: Option<&KeyedStore>,
        listener: Listener,
    ) {
        for kind in kinds {
            self.listeners
                .entry(*kind)
                .or_default()
                .entry(database.to_string())
                .or_default()
                .push(listener.clone());

            if let Some(store) = replay {
                store.for_each(|id, value| listener(id, value));
            }
        }
    }

    /// Invoke every listener for `(kind, database)`.
    pub fn publish(&self, kind: EventKind, database: &str, id: &str, value: &Value) {
        let Some(listeners) = self.listeners.get(&kind).and_then(|dbs| dbs.get(database)) else {
            return;
        };
        for listener in listeners {
            listener(id, value);
        }
    }

    /// Listeners registered for `(kind, database)`.
    pub fn listener_count(&self, kind: EventKind, database: &str) -> usize {
        self.listeners
            .get(&kind)
            .and_then(|dbs| dbs.get(database))
            .map_or(0, Vec::len)
    }

    fn total_listeners(&self) -> usize {
        self.listeners
            .values()
            .flat_map(|dbs| dbs.values())
            .map(Vec::len)
            .sum()
    }
}
