//! Manager state and the committed snapshot.
//!
//! # State Transitions
//!
//! ```text
//!             start()
//! Starting ───────────────→ Running
//!    │                         │
//!    │ (registration or        │ close()
//!    │  first round failed)    ↓
//!    ↓                    ShuttingDown
//! Failed                       │
//!                              ↓
//!                           Stopped
//! ```

use crate::prober::ProbeReport;
use crate::replica::{now, Replica};
use chrono::{DateTime, Utc};

/// Lifecycle state of a [`ReplicaManager`](super::ReplicaManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Registering our own row and running the first round.
    Starting,

    /// Background tasks are heartbeating, listening and reaping.
    Running,

    /// `close()` called. Tasks are being joined.
    ShuttingDown,

    /// Tasks joined, own row marked stopped.
    Stopped,

    /// Startup aborted. No background tasks were left running.
    Failed,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Starting => write!(f, "Starting"),
            ManagerState::Running => write!(f, "Running"),
            ManagerState::ShuttingDown => write!(f, "ShuttingDown"),
            ManagerState::Stopped => write!(f, "Stopped"),
            ManagerState::Failed => write!(f, "Failed"),
        }
    }
}

/// Result of one complete refresh round.
///
/// Immutable once built. Readers hold an `Arc` to it, so a round in
/// progress never changes what they see.
#[derive(Debug, Clone)]
pub struct ReplicaSnapshot {
    self_replica: Replica,
    peers: Vec<Replica>,
    probe: ProbeReport,
    refreshed_at: DateTime<Utc>,
}

impl ReplicaSnapshot {
    pub fn new(self_replica: Replica, peers: Vec<Replica>, probe: ProbeReport) -> Self {
        Self {
            self_replica,
            peers,
            probe,
            refreshed_at: now(),
        }
    }

    /// Our own row as last written, including the current `error`.
    pub fn self_replica(&self) -> &Replica {
        &self.self_replica
    }

    /// Every live replica other than ourselves.
    pub fn peers(&self) -> &[Replica] {
        &self.peers
    }

    /// Peers that share our region.
    pub fn regional(&self) -> Vec<Replica> {
        self.in_region(self.self_replica.region_id)
    }

    /// Peers in `region_id`.
    pub fn in_region(&self, region_id: i32) -> Vec<Replica> {
        self.peers
            .iter()
            .filter(|p| p.region_id == region_id)
            .cloned()
            .collect()
    }

    /// Every primary replica, ourselves included when we are primary.
    pub fn all_primary(&self) -> Vec<Replica> {
        std::iter::once(&self.self_replica)
            .chain(self.peers.iter())
            .filter(|r| r.primary)
            .cloned()
            .collect()
    }

    /// Probe outcomes from the round that produced this snapshot.
    pub fn probe(&self) -> &ProbeReport {
        &self.probe
    }

    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }
}
