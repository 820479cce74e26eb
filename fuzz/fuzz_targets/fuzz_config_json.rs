//! Fuzz target for config parsing.
//!
//! `ReplicaSyncConfig::from_json` should reject bad input with an error,
//! never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_sync::ReplicaSyncConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(json) = std::str::from_utf8(data) {
        // Anything accepted must survive a serialize/parse round trip.
        if let Ok(config) = ReplicaSyncConfig::from_json(json) {
            if let Ok(again) = serde_json::to_string(&config) {
                assert!(ReplicaSyncConfig::from_json(&again).is_ok());
            }
        }
    }
});
