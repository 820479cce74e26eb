//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Refresh rounds (duration, outcome, peer counts)
//! - Peer probes (latency, reachability)
//! - Store round-trips and busy retries
//! - Notification bus traffic
//! - Reaper deletions
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replica_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! No recorder is installed by this crate. Without one every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use replica_sync::metrics;
//! use std::time::Duration;
//!
//! metrics::record_refresh("heartbeat", true, Duration::from_millis(12));
//! metrics::set_peer_counts(3, 2, 1);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Refresh Round Metrics
// =============================================================================

/// Record a completed refresh round and what triggered it.
pub fn record_refresh(trigger: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replica_sync_refresh_total",
        "trigger" => trigger.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("replica_sync_refresh_duration_seconds").record(duration.as_secs_f64());
}

/// Record a refresh request that was folded into one already pending.
pub fn record_refresh_coalesced(trigger: &str) {
    counter!("replica_sync_refresh_coalesced_total", "trigger" => trigger.to_string())
        .increment(1);
}

/// Peer view after a refresh round.
pub fn set_peer_counts(peers: usize, regional: usize, unreachable: usize) {
    gauge!("replica_sync_peers").set(peers as f64);
    gauge!("replica_sync_regional_peers").set(regional as f64);
    gauge!("replica_sync_unreachable_peers").set(unreachable as f64);
}

/// Record that our own row had to be re-inserted after being reaped.
pub fn record_reinsert() {
    counter!("replica_sync_reinserts_total").increment(1);
}

// =============================================================================
// Peer Probe Metrics
// =============================================================================

/// Record one probe of a peer's health endpoint.
///
/// Labelled by the peer's region, not its id: ids churn with every restart.
pub fn record_probe(region_id: i32, success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replica_sync_probes_total",
        "region" => region_id.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("replica_sync_probe_latency_seconds", "region" => region_id.to_string())
        .record(latency.as_secs_f64());
}

// =============================================================================
// Store Metrics
// =============================================================================

/// Store round-trip measured during a refresh round.
pub fn record_store_latency(latency: Duration) {
    histogram!("replica_sync_store_latency_seconds").record(latency.as_secs_f64());
}

/// Count a SQLite busy retry.
pub fn record_store_retry(operation: &str) {
    counter!("replica_sync_store_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record stale rows removed by the reaper.
pub fn record_reaped(count: u64) {
    counter!("replica_sync_reaped_total").increment(count);
}

// =============================================================================
// Notification Metrics
// =============================================================================

/// Record a publish attempt on the notification bus.
pub fn record_publish(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replica_sync_notifications_published_total", "status" => status).increment(1);
}

/// Record a notification received from the bus.
pub fn record_notification_received() {
    counter!("replica_sync_notifications_received_total").increment(1);
}

// =============================================================================
// Lifecycle Metrics
// =============================================================================

/// Gauge for manager state.
pub fn set_manager_state(state: &str) {
    let value = match state {
        "Starting" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("replica_sync_manager_state").set(value);
}
