// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background tasks.
//!
//! Every task runs until the shutdown signal flips to `true`:
//!
//! ```text
//!  listener ──┐
//! heartbeat ──┼── try_send(trigger) ──► [cap 1] ──► refresh worker ──► Shared::refresh()
//!    reaper ──┘
//! ```
//!
//! The trigger channel holds at most one pending request. Triggers that
//! arrive while one is pending are folded into it, so a burst of
//! notifications costs one extra round, not one round each.

use super::refresh::Shared;
use crate::metrics;
use crate::pubsub::Subscription;
use crate::replica::now;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Why a round was requested (metrics label).
pub(crate) type Trigger = &'static str;

/// Request a round. Returns `false` once the worker is gone.
fn request_refresh(tx: &mpsc::Sender<Trigger>, trigger: Trigger) -> bool {
    match tx.try_send(trigger) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            metrics::record_refresh_coalesced(trigger);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Returns `true` when `changed()` means "stop".
fn is_shutdown(result: Result<(), watch::error::RecvError>, rx: &watch::Receiver<bool>) -> bool {
    result.is_err() || *rx.borrow()
}

fn interval_skipping_first(period: Duration) -> tokio::time::Interval {
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

/// Single consumer of refresh triggers.
pub(crate) async fn run_refresh_worker(
    shared: Arc<Shared>,
    mut triggers: mpsc::Receiver<Trigger>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow_and_update() {
        return;
    }
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if is_shutdown(result, &shutdown_rx) {
                    break;
                }
            }

            trigger = triggers.recv() => {
                let Some(trigger) = trigger else { break };
                if let Err(e) = shared.refresh(trigger).await {
                    if e.is_shutdown() {
                        break;
                    }
                }
            }
        }
    }
    debug!("Refresh worker stopped");
}

/// Turn bus notifications into refresh requests.
///
/// Payloads are not inspected: any notification means "re-read the table".
pub(crate) async fn run_listener(
    mut subscription: Subscription,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow_and_update() {
        subscription.close().await;
        return;
    }
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if is_shutdown(result, &shutdown_rx) {
                    break;
                }
            }

            message = subscription.recv() => match message {
                Some(payload) => {
                    metrics::record_notification_received();
                    debug!(payload = %String::from_utf8_lossy(&payload), "Replica notification");
                    if !request_refresh(&triggers, "notification") {
                        break;
                    }
                }
                None => {
                    warn!("Notification subscription ended, relying on heartbeat");
                    break;
                }
            }
        }
    }
    subscription.close().await;
    debug!("Notification listener stopped");
}

/// Periodic self-refresh proving liveness.
pub(crate) async fn run_heartbeat(
    update_interval: Duration,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow_and_update() {
        return;
    }
    let mut timer = interval_skipping_first(update_interval);
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if is_shutdown(result, &shutdown_rx) {
                    break;
                }
            }

            _ = timer.tick() => {
                if !request_refresh(&triggers, "heartbeat") {
                    break;
                }
            }
        }
    }
    debug!("Heartbeat stopped");
}

/// Delete rows whose heartbeat is older than `cleanup_interval`.
///
/// Any replica may reap any row. The age predicate is evaluated by the
/// store at delete time, so a row refreshed in the meantime survives.
pub(crate) async fn run_reaper(
    shared: Arc<Shared>,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow_and_update() {
        return;
    }
    let cleanup_interval = shared.options.cleanup_interval;
    let ttl = match chrono::Duration::from_std(cleanup_interval) {
        Ok(ttl) => ttl,
        Err(e) => {
            warn!(error = %e, "cleanup_interval out of range, reaper disabled");
            return;
        }
    };
    let mut timer = interval_skipping_first(cleanup_interval);

    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if is_shutdown(result, &shutdown_rx) {
                    break;
                }
            }

            _ = timer.tick() => {
                let Some(cutoff) = now().checked_sub_signed(ttl) else {
                    continue;
                };
                match shared.store.delete_updated_before(cutoff).await {
                    Ok(0) => {}
                    Ok(deleted) => {
                        metrics::record_reaped(deleted);
                        debug!(deleted, "Reaped stale replicas");
                        if !request_refresh(&triggers, "reaper") {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to delete stale replicas"),
                }
            }
        }
    }
    debug!("Reaper stopped");
}

/// Forward a parent lifetime signal into our own shutdown signal.
pub(crate) async fn run_parent_relay(
    mut parent_rx: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow_and_update() {
        return;
    }
    if *parent_rx.borrow_and_update() {
        info!("Parent already shut down, stopping background tasks");
        shutdown_tx.send_replace(true);
        return;
    }
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if is_shutdown(result, &shutdown_rx) {
                    break;
                }
            }

            result = parent_rx.changed() => {
                if is_shutdown(result, &parent_rx) {
                    info!("Parent shut down, stopping background tasks");
                    shutdown_tx.send_replace(true);
                    break;
                }
            }
        }
    }
}
