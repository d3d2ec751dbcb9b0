//! Fuzz target for write ordering.
//!
//! Tests that the default conflict policy is a strict total order on
//! distinct stamps, so every node resolves a conflict the same way.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_replication::{ConflictPolicy, Stamp};

fuzz_target!(|data: ((u64, &str), (u64, &str))| {
    let ((ta, oa), (tb, ob)) = data;
    let a = Stamp::new(ta, oa);
    let b = Stamp::new(tb, ob);
    let policy = ConflictPolicy::TimeThenOrigin;

    let ab = policy.supersedes(&a, &b);
    let ba = policy.supersedes(&b, &a);

    // Irreflexive
    assert!(!policy.supersedes(&a, &a));
    if a == b {
        assert!(!ab && !ba);
    } else {
        // Exactly one direction wins
        assert!(ab ^ ba);
    }

    // Strict time never accepts an equal time
    if ta == tb {
        assert!(!ConflictPolicy::StrictTime.supersedes(&a, &b));
    }
});
