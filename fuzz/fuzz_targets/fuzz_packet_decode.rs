//! Fuzz target for wire packet decoding.
//!
//! Arbitrary bytes must either fail to decode or yield a packet whose
//! stamp and forwarded copies are well formed.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_replication::Packet;

fuzz_target!(|data: &[u8]| {
    // Should never panic
    let Ok(packet) = serde_json::from_slice::<Packet>(data) else {
        return;
    };

    let stamp = packet.stamp();
    assert_eq!(stamp.time, packet.t);
    assert_eq!(stamp.origin, packet.origin());

    let next = packet.with_receivers(&["fuzz".to_string()]);
    assert_eq!(next.rcv.len(), packet.rcv.len() + 1);
    assert_eq!(next.stamp(), stamp);
});
