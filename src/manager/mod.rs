// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica manager.
//!
//! The orchestrator that ties together:
//! - The shared replica table via [`crate::store::ReplicaStore`]
//! - Change notifications via [`crate::pubsub::Pubsub`]
//! - Peer probing via [`crate::prober::Prober`]
//!
//! # Lifecycle
//!
//! [`ReplicaManager::start()`] registers our row, publishes our id, runs one
//! refresh round and only then returns, so the caller gets a handle with a
//! complete snapshot. It then keeps four tasks running until
//! [`close()`](ReplicaManager::close):
//! 1. Refresh worker (the only task that runs rounds)
//! 2. Notification listener
//! 3. Heartbeat every `update_interval`
//! 4. Reaper every `cleanup_interval`
//!
//! Replicas never talk to each other except through the store, the bus and
//! the health endpoint. Nothing here assumes an in-process lock helps across
//! processes.

mod refresh;
mod tasks;
mod types;

pub use refresh::{Callback, STALE_AFTER_HEARTBEATS};
pub use types::{ManagerState, ReplicaSnapshot};

use crate::config::ReplicaSyncOptions;
use crate::error::{ReplicaSyncError, Result};
use crate::metrics;
use crate::prober::Prober;
use crate::pubsub::{Pubsub, Subscription, PUBSUB_EVENT};
use crate::replica::{now, Replica};
use crate::store::ReplicaStore;
use refresh::Shared;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// How long `close()` waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a registered replica.
///
/// Reads are served from the last committed [`ReplicaSnapshot`] and never
/// wait on a round in progress.
pub struct ReplicaManager {
    shared: Arc<Shared>,

    /// Lifecycle state (broadcast to watchers)
    state_tx: watch::Sender<ManagerState>,

    /// Shutdown signal sender (shared with the parent relay task)
    shutdown_tx: Arc<watch::Sender<bool>>,

    /// Set by the first `close()`
    closed: AtomicBool,

    /// Background task handles
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ReplicaManager {
    /// Register this process and start background discovery.
    ///
    /// Fails if the options are invalid or the store cannot be written.
    /// Bus failures are logged and do not fail startup.
    pub async fn start(
        store: Arc<dyn ReplicaStore>,
        pubsub: Arc<dyn Pubsub>,
        options: ReplicaSyncOptions,
    ) -> Result<Self> {
        Self::start_inner(store, pubsub, options, None).await
    }

    /// Like [`start()`](Self::start), but background tasks also stop when
    /// `parent` flips to `true`. `close()` is still needed to mark the row
    /// stopped.
    pub async fn start_with_shutdown(
        store: Arc<dyn ReplicaStore>,
        pubsub: Arc<dyn Pubsub>,
        options: ReplicaSyncOptions,
        parent: watch::Receiver<bool>,
    ) -> Result<Self> {
        Self::start_inner(store, pubsub, options, Some(parent)).await
    }

    async fn start_inner(
        store: Arc<dyn ReplicaStore>,
        pubsub: Arc<dyn Pubsub>,
        options: ReplicaSyncOptions,
        parent: Option<watch::Receiver<bool>>,
    ) -> Result<Self> {
        options.validate()?;
        let id = options.id.unwrap_or_else(Uuid::new_v4);
        let span = tracing::info_span!("replica_sync", replica_id = %id);

        let (state_tx, _) = watch::channel(ManagerState::Starting);
        metrics::set_manager_state("Starting");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let prober = Prober::new(options.peer_timeout, options.tls_config.clone())?;

        let startup = async {
            info!(
                relay_address = %options.relay_address,
                region_id = options.region_id,
                "Registering replica"
            );

            // Subscribe before registering so we never miss a peer that
            // registers right after us.
            let subscription = match pubsub.subscribe(PUBSUB_EVENT).await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    warn!(error = %e, "Failed to subscribe to replica notifications, relying on heartbeat");
                    None
                }
            };

            match Self::register(id, &store, &pubsub, &options, prober, shutdown_rx.clone()).await {
                Ok(shared) => Ok((shared, subscription)),
                Err(e) => {
                    if let Some(sub) = subscription {
                        sub.close().await;
                    }
                    Err(e)
                }
            }
        }
        .instrument(span.clone())
        .await;

        let (shared, subscription) = match startup {
            Ok(started) => started,
            Err(e) => {
                span.in_scope(|| error!(error = %e, "Replica startup failed"));
                state_tx.send_replace(ManagerState::Failed);
                metrics::set_manager_state("Failed");
                return Err(e);
            }
        };

        let manager = Self {
            shared,
            state_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
            handles: RwLock::new(Vec::new()),
        };
        manager.spawn_tasks(subscription, parent, span).await;

        manager.state_tx.send_replace(ManagerState::Running);
        metrics::set_manager_state("Running");
        Ok(manager)
    }

    /// Insert our row, announce it and run the first round.
    async fn register(
        id: Uuid,
        store: &Arc<dyn ReplicaStore>,
        pubsub: &Arc<dyn Pubsub>,
        options: &ReplicaSyncOptions,
        prober: Prober,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Arc<Shared>> {
        let latency = store.ping().await?;

        let mut row = Replica::new(id, options.resolved_hostname(), options.relay_address.clone());
        row.region_id = options.region_id;
        row.primary = options.primary;
        row.version = env!("CARGO_PKG_VERSION").to_string();
        row.database_latency = i32::try_from(latency.as_micros()).unwrap_or(i32::MAX);

        let row = match store.insert(row.clone()).await {
            Ok(row) => row,
            // Same id registered before (restart with a fixed id): take it over.
            Err(insert_err) => match store.update(row).await {
                Ok(row) => {
                    debug!("Replica row already existed, updated in place");
                    row
                }
                Err(ReplicaSyncError::NotFound(_)) => return Err(insert_err),
                Err(e) => return Err(e),
            },
        };

        let shared = Arc::new(Shared::new(
            options.clone(),
            store.clone(),
            pubsub.clone(),
            prober,
            row,
            shutdown_rx,
        ));

        // Logged inside; peers still see us on their next heartbeat.
        let _ = shared.publish().await;

        shared.refresh("startup").await?;
        info!("Replica registered");
        Ok(shared)
    }

    async fn spawn_tasks(
        &self,
        subscription: Option<Subscription>,
        parent: Option<watch::Receiver<bool>>,
        span: tracing::Span,
    ) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut handles = self.handles.write().await;

        handles.push(tokio::spawn(
            tasks::run_refresh_worker(self.shared.clone(), trigger_rx, shutdown_rx.clone())
                .instrument(span.clone()),
        ));

        if let Some(sub) = subscription {
            handles.push(tokio::spawn(
                tasks::run_listener(sub, trigger_tx.clone(), shutdown_rx.clone())
                    .instrument(span.clone()),
            ));
        }

        handles.push(tokio::spawn(
            tasks::run_heartbeat(
                self.shared.options.update_interval,
                trigger_tx.clone(),
                shutdown_rx.clone(),
            )
            .instrument(span.clone()),
        ));

        handles.push(tokio::spawn(
            tasks::run_reaper(self.shared.clone(), trigger_tx, shutdown_rx.clone())
                .instrument(span.clone()),
        ));

        if let Some(parent_rx) = parent {
            handles.push(tokio::spawn(
                tasks::run_parent_relay(parent_rx, self.shutdown_tx.clone(), shutdown_rx)
                    .instrument(span),
            ));
        }
    }

    /// This replica's id.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state_tx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ManagerState> {
        self.state_tx.subscribe()
    }

    /// Check if background discovery is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ManagerState::Running)
    }

    /// The last committed snapshot.
    pub fn snapshot(&self) -> Arc<ReplicaSnapshot> {
        self.shared.snapshot()
    }

    /// Receiver that observes every committed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ReplicaSnapshot>> {
        self.shared.subscribe_snapshots()
    }

    /// Our own row as last written, including the current `error`.
    pub fn self_replica(&self) -> Replica {
        self.snapshot().self_replica().clone()
    }

    /// Every live replica other than ourselves.
    pub fn peers(&self) -> Vec<Replica> {
        self.snapshot().peers().to_vec()
    }

    /// Peers that share our region.
    pub fn regional(&self) -> Vec<Replica> {
        self.snapshot().regional()
    }

    /// Peers in `region_id`.
    pub fn in_region(&self, region_id: i32) -> Vec<Replica> {
        self.snapshot().in_region(region_id)
    }

    /// Every primary replica, ourselves included.
    pub fn all_primary(&self) -> Vec<Replica> {
        self.snapshot().all_primary()
    }

    /// Replace the callback invoked after every round.
    ///
    /// The new callback runs once right away against the current snapshot.
    /// It is never invoked concurrently with itself, and must not call back
    /// into [`refresh()`](Self::refresh) or `set_callback()`.
    pub async fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&ReplicaSnapshot) + Send + Sync + 'static,
    {
        self.shared.set_callback(Some(Arc::new(callback))).await;
    }

    /// Remove the callback.
    pub async fn clear_callback(&self) {
        self.shared.set_callback(None).await;
    }

    /// Run a round now and return its snapshot.
    pub async fn refresh(&self) -> Result<Arc<ReplicaSnapshot>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicaSyncError::InvalidState {
                expected: ManagerState::Running.to_string(),
                actual: self.state().to_string(),
            });
        }
        self.shared.refresh("manual").await
    }

    /// Stop every background task and mark our row stopped.
    ///
    /// Idempotent. Returns an error only if the final row update or the final
    /// notification fails; background tasks are stopped either way.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let span = tracing::info_span!("replica_sync", replica_id = %self.shared.id);
        async {
            info!("Closing replica manager");
            self.state_tx.send_replace(ManagerState::ShuttingDown);
            metrics::set_manager_state("ShuttingDown");

            self.shutdown_tx.send_replace(true);

            let handles: Vec<_> = {
                let mut guard = self.handles.write().await;
                std::mem::take(&mut *guard)
            };
            for (i, mut handle) in handles.into_iter().enumerate() {
                match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
                    Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                    Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                    Err(_) => {
                        warn!(task = i + 1, "Task did not stop within drain timeout, aborting");
                        handle.abort();
                        let _ = handle.await;
                    }
                }
            }

            let result = match self.shared.mark_stopped().await {
                Ok(()) => self.shared.publish().await,
                Err(e) => Err(e),
            };

            self.state_tx.send_replace(ManagerState::Stopped);
            metrics::set_manager_state("Stopped");
            info!(stopped_at = %now(), "Replica manager stopped");
            result
        }
        .instrument(span)
        .await
    }
}

impl Drop for ReplicaManager {
    fn drop(&mut self) {
        // Tasks stop on their own; the row is left for the reaper.
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for ReplicaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaManager")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
