// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Refresh rounds.
//!
//! A round is the only writer of the snapshot and of our own row. Rounds are
//! serialized by the `round` mutex, which also holds the last row we wrote:
//!
//! 1. List every row in the store
//! 2. Split into ourselves and live peers (rows without `stopped_at`, updated
//!    within the last [`STALE_AFTER_HEARTBEATS`] heartbeats)
//! 3. Probe every dialable peer and wait for all of them
//! 4. Measure the store round-trip
//! 5. Update our row (re-insert if it was reaped)
//! 6. Publish our id if the row was re-inserted or our `error` changed
//! 7. Swap the new snapshot in, then run the callback
//!
//! Plain heartbeats that change nothing do not publish. Every replica
//! refreshes on every notification, so publishing on each round would keep
//! the whole fleet refreshing in a loop.

use super::types::ReplicaSnapshot;
use crate::config::ReplicaSyncOptions;
use crate::error::{ReplicaSyncError, Result};
use crate::metrics;
use crate::prober::Prober;
use crate::pubsub::{Pubsub, PUBSUB_EVENT};
use crate::replica::{now, Replica};
use crate::store::ReplicaStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Missed heartbeats after which a row no longer counts as a live peer.
/// The row itself stays until the reaper removes it.
pub const STALE_AFTER_HEARTBEATS: u32 = 3;

/// Consumer hook invoked after every completed round.
pub type Callback = Arc<dyn Fn(&ReplicaSnapshot) + Send + Sync>;

/// State shared by the manager handle and its background tasks.
pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) options: ReplicaSyncOptions,
    pub(crate) store: Arc<dyn ReplicaStore>,
    pub(crate) pubsub: Arc<dyn Pubsub>,
    prober: Prober,
    /// Serializes rounds. Holds our row as last written.
    round: Mutex<Replica>,
    snapshot_tx: watch::Sender<Arc<ReplicaSnapshot>>,
    callback: std::sync::Mutex<Option<Callback>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Shared {
    pub(crate) fn new(
        options: ReplicaSyncOptions,
        store: Arc<dyn ReplicaStore>,
        pubsub: Arc<dyn Pubsub>,
        prober: Prober,
        self_row: Replica,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let initial = Arc::new(ReplicaSnapshot::new(self_row.clone(), Vec::new(), Default::default()));
        let (snapshot_tx, _) = watch::channel(initial);
        Self {
            id: self_row.id,
            options,
            store,
            pubsub,
            prober,
            round: Mutex::new(self_row),
            snapshot_tx,
            callback: std::sync::Mutex::new(None),
            shutdown_rx,
        }
    }

    /// Last committed snapshot. Never waits on a round in progress.
    pub(crate) fn snapshot(&self) -> Arc<ReplicaSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub(crate) fn subscribe_snapshots(&self) -> watch::Receiver<Arc<ReplicaSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    fn current_callback(&self) -> Option<Callback> {
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the callback and run it once against the current snapshot.
    ///
    /// Takes the round lock so the callback never runs concurrently with a
    /// round's invocation of it.
    pub(crate) async fn set_callback(&self, callback: Option<Callback>) {
        let _round = self.round.lock().await;
        *self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback.clone();
        if let Some(cb) = callback {
            let snapshot = self.snapshot();
            cb(&snapshot);
        }
    }

    /// Announce a change to our row. Failures only delay convergence.
    pub(crate) async fn publish(&self) -> Result<()> {
        let payload = self.id.to_string();
        let result = self.pubsub.publish(PUBSUB_EVENT, payload.as_bytes()).await;
        metrics::record_publish(result.is_ok());
        if let Err(e) = &result {
            warn!(error = %e, "Failed to publish replica notification");
        }
        result
    }

    /// Run one complete round.
    pub(crate) async fn refresh(&self, trigger: &'static str) -> Result<Arc<ReplicaSnapshot>> {
        let mut self_row = self.round.lock().await;
        let started = Instant::now();
        let result = self.run_round(&mut self_row).await;
        metrics::record_refresh(trigger, result.is_ok(), started.elapsed());
        match &result {
            Ok(snapshot) => debug!(
                trigger,
                peers = snapshot.peers().len(),
                unreachable = snapshot.probe().unreachable_count(),
                "Refresh round complete"
            ),
            Err(e) if e.is_shutdown() => debug!(trigger, "Refresh round cancelled by shutdown"),
            Err(e) if e.is_retryable() => {
                warn!(trigger, error = %e, "Refresh round failed, retrying on next trigger")
            }
            Err(e) => error!(trigger, error = %e, "Refresh round failed"),
        }
        result
    }

    async fn run_round(&self, self_row: &mut Replica) -> Result<Arc<ReplicaSnapshot>> {
        let replicas = self.store.list().await?;
        let stale_before = self.stale_before();
        let peers: Vec<Replica> = replicas
            .into_iter()
            .filter(|r| r.id != self.id && !r.is_stopped())
            .filter(|r| stale_before.map_or(true, |cutoff| r.updated_at > cutoff))
            .collect();

        // A peer without a relay address has nothing to dial.
        let dialable: Vec<Replica> = peers
            .iter()
            .filter(|p| !p.relay_address.is_empty())
            .cloned()
            .collect();
        let mut shutdown = self.shutdown_rx.clone();
        let probe = self.prober.probe(&dialable, &mut shutdown).await?;

        let latency = self.store.ping().await?;
        metrics::record_store_latency(latency);

        let previous_error = self_row.error.clone();
        let mut next = self_row.clone();
        next.updated_at = now();
        next.error = probe.error_message();
        next.database_latency = latency_micros(latency);

        let (written, reinserted) = match self.store.update(next.clone()).await {
            Ok(row) => (row, false),
            Err(ReplicaSyncError::NotFound(_)) => {
                info!("Own replica row was deleted, re-inserting");
                next.created_at = next.updated_at;
                let row = self.store.insert(next).await?;
                metrics::record_reinsert();
                (row, true)
            }
            Err(e) => return Err(e),
        };

        let error_changed = written.error != previous_error;
        if error_changed && !written.error.is_empty() {
            warn!(error = %written.error, "Peers unreachable");
        } else if error_changed {
            info!("All peers reachable again");
        }
        *self_row = written.clone();

        if reinserted || error_changed {
            // Logged inside; a lost notification is corrected by the next heartbeat.
            let _ = self.publish().await;
        }

        let snapshot = Arc::new(ReplicaSnapshot::new(written, peers, probe));
        self.snapshot_tx.send_replace(snapshot.clone());
        metrics::set_peer_counts(
            snapshot.peers().len(),
            snapshot.regional().len(),
            snapshot.probe().unreachable_count(),
        );

        if let Some(cb) = self.current_callback() {
            cb(&snapshot);
        }
        Ok(snapshot)
    }

    /// Rows last updated at or before this instant have missed
    /// [`STALE_AFTER_HEARTBEATS`] heartbeats and are not treated as peers.
    fn stale_before(&self) -> Option<DateTime<Utc>> {
        let window = self
            .options
            .update_interval
            .checked_mul(STALE_AFTER_HEARTBEATS)?;
        now().checked_sub_signed(chrono::Duration::from_std(window).ok()?)
    }

    /// Write the final row for a graceful shutdown.
    ///
    /// A row that was already reaped stays deleted.
    pub(crate) async fn mark_stopped(&self) -> Result<()> {
        let mut self_row = self.round.lock().await;
        let mut stopped = self_row.clone();
        let at = now();
        stopped.stopped_at = Some(at);
        stopped.updated_at = at;

        match self.store.update(stopped).await {
            Ok(row) => {
                *self_row = row;
                Ok(())
            }
            Err(ReplicaSyncError::NotFound(_)) => {
                debug!("Own replica row already gone at shutdown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Store latency as stored in the row, saturating at `i32::MAX` microseconds.
fn latency_micros(latency: Duration) -> i32 {
    i32::try_from(latency.as_micros()).unwrap_or(i32::MAX)
}
