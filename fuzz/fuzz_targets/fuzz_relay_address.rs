//! Fuzz target for relay address handling.
//!
//! Peers publish arbitrary relay addresses into the shared store, so
//! `health_check_url` and the report formatting must never panic on them.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_sync::{health_check_url, ProbeOutcome, ProbeReport, Replica, HEALTH_CHECK_PATH};

fuzz_target!(|data: (&str, &str)| {
    let (relay_address, reason) = data;

    // A resolved URL always targets the health path, whatever the input path was.
    if let Ok(url) = health_check_url(relay_address) {
        assert_eq!(url.path(), HEALTH_CHECK_PATH);
    }

    let mut report = ProbeReport::default();
    report.record(
        &Replica::for_testing(relay_address),
        ProbeOutcome::Unreachable { reason: reason.to_string() },
    );
    assert!(report.error_message().starts_with("Failed to dial peers"));
});
