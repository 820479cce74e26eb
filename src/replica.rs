// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replica row.
//!
//! One [`Replica`] exists per live process. `updated_at` is the liveness
//! clock: it is refreshed on every heartbeat and is the only thing the
//! reaper looks at. There is no separate "alive" flag.
//!
//! `error` is written exclusively by the replica that owns the row and only
//! ever describes that replica's own outbound probes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time, truncated to microseconds.
///
/// The store keeps microsecond precision, so truncating here keeps the
/// in-memory copy equal to what a later `list()` returns.
pub fn now() -> DateTime<Utc> {
    truncate_micros(Utc::now())
}

/// Drop sub-microsecond precision from a timestamp.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(ts.timestamp_micros())
}

/// Convert microseconds since the Unix epoch back into a timestamp.
///
/// Out-of-range values clamp to the epoch.
pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default()
}

/// A registered, heartbeating process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Assigned once at creation, immutable.
    pub id: Uuid,
    /// Set on first insert, immutable afterwards.
    pub created_at: DateTime<Utc>,
    /// Set once when the process started.
    pub started_at: DateTime<Utc>,
    /// Set by a graceful shutdown. A stopped replica is not a live peer.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Refreshed on every heartbeat.
    pub updated_at: DateTime<Utc>,
    /// Human-readable origin label.
    pub hostname: String,
    /// Region classification used by `regional()`.
    pub region_id: i32,
    /// Where this replica's relay/health endpoint can be reached.
    pub relay_address: String,
    /// Store round-trip measured by the owner in its last round (microseconds).
    pub database_latency: i32,
    /// Crate version of the process that wrote the row.
    pub version: String,
    /// Last connectivity failure to peers; empty when healthy.
    pub error: String,
    /// Primary replicas participate in full-cluster convergence.
    pub primary: bool,
}

impl Replica {
    /// A fresh row with every timestamp set to `now()`.
    pub fn new(id: Uuid, hostname: impl Into<String>, relay_address: impl Into<String>) -> Self {
        let now = now();
        Self {
            id,
            created_at: now,
            started_at: now,
            stopped_at: None,
            updated_at: now,
            hostname: hostname.into(),
            region_id: 0,
            relay_address: relay_address.into(),
            database_latency: 0,
            version: String::new(),
            error: String::new(),
            primary: true,
        }
    }

    /// A primary replica with a random id, for tests.
    pub fn for_testing(relay_address: &str) -> Self {
        Self::new(Uuid::new_v4(), "something", relay_address)
    }

    /// Whether the owner has announced a graceful shutdown.
    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }

    /// Whether the last refresh round of the owner reached every peer.
    pub fn is_healthy(&self) -> bool {
        self.error.is_empty()
    }
}
