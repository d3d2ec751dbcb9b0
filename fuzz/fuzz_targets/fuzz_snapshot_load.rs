//! Fuzz target for snapshot loading.
//!
//! Whatever sits under a snapshot key, opening the store must not panic,
//! and a store that loaded must accept a write and reload it.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_replication::{ConflictPolicy, KeyedStore, MemoryStorage, Persistence, Stamp};
use serde_json::json;

fuzz_target!(|raw: &str| {
    let mut storage = MemoryStorage::new();
    storage.write("dbs.fuzz", raw.to_string());

    // Should never panic
    let mut store = KeyedStore::open("fuzz", "dbs.fuzz", ConflictPolicy::default(), &storage);
    let kind = store.put("fuzz-id", Stamp::new(u64::MAX, "fuzzer"), json!("v"), &mut storage);

    let reloaded = KeyedStore::open("fuzz", "dbs.fuzz", ConflictPolicy::default(), &storage);
    if kind.is_accepted() {
        assert_eq!(reloaded.len(), store.len());
        assert_eq!(reloaded.get("fuzz-id"), Some(&json!("v")));
    }
});
