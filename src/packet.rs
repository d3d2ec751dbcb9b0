// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The gossip unit exchanged between peers.
//!
//! A [`Packet`] carries one write (`db`, `id`, `data`) stamped with the
//! originating node's logical time, plus the receiver list `rcv`: every peer
//! the senders along the way already know will get (or got) this packet.
//! `rcv` only drives flood suppression and membership discovery; it is not
//! an acknowledgement.
//!
//! # Wire Shape
//!
//! ```json
//! {"src": "user1", "t": 4, "rcv": ["user2"], "db": "docs", "id": "x", "data": ["a", "b"]}
//! ```
//!
//! Dumps of existing records to a freshly opened link additionally carry
//! `"origin"` when the record was written by a node other than `src`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Identity of a node in the mesh.
pub type PeerId = String;

/// Logical timestamp of a write together with the node that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub time: u64,
    pub origin: PeerId,
}

impl Stamp {
    pub fn new(time: u64, origin: impl Into<PeerId>) -> Self {
        Self {
            time,
            origin: origin.into(),
        }
    }

    /// Total order: time first, origin id as tie-breaker.
    pub fn cmp_with_origin(&self, other: &Stamp) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

/// A replicated write in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Node that sent this copy (the writer, except for dumps).
    pub src: PeerId,
    /// Logical time of the write.
    pub t: u64,
    /// Peers already known to receive this packet.
    pub rcv: Vec<PeerId>,
    /// Database name.
    pub db: String,
    /// Key within the database.
    pub id: String,
    /// Opaque value, replaced wholesale on acceptance.
    pub data: Value,
    /// Original writer when it differs from `src`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<PeerId>,
}

impl Packet {
    /// The node that issued the write.
    pub fn origin(&self) -> &str {
        self.origin.as_deref().unwrap_or(&self.src)
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.t, self.origin())
    }

    /// Copy of this packet with `further` appended to the receiver list.
    ///
    /// Each forwarding hop sends such a copy; the packet that arrived is left
    /// untouched.
    pub fn with_receivers(&self, further: &[PeerId]) -> Packet {
        let mut next = self.clone();
        next.rcv.extend(further.iter().cloned());
        next
    }
}
