//! # Replica Sync
//!
//! Replica discovery and health convergence for a fleet of independently
//! running server processes.
//!
//! ## Architecture
//!
//! Every process registers one row in a shared table, announces changes on a
//! pub/sub bus, and probes every peer's relay endpoint:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            ReplicaManager                                │
//! │                                                                          │
//! │  ┌───────────┐   ┌───────────┐   ┌──────────┐                            │
//! │  │ listener  │   │ heartbeat │   │  reaper  │── delete stale rows ──┐    │
//! │  └─────┬─────┘   └─────┬─────┘   └────┬─────┘                       │    │
//! │        └───── trigger ─┴──────────────┘                             │    │
//! │                  ▼                                                  ▼    │
//! │          ┌────────────────┐   list/update   ┌──────────────────────────┐ │
//! │          │ refresh worker │────────────────►│ ReplicaStore (SQLite)    │ │
//! │          └───────┬────────┘                 └──────────────────────────┘ │
//! │                  │ probe peers (concurrent, per-peer timeout)            │
//! │                  ▼                                                       │
//! │          ┌────────────────┐   GET /derp/latency-check                    │
//! │          │     Prober     │─────────────────────────────► peer relays    │
//! │          └───────┬────────┘                                              │
//! │                  ▼                                                       │
//! │          ReplicaSnapshot (watch) ──► reads + callback                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Notifications are hints only. Any message on [`PUBSUB_EVENT`] makes every
//! replica re-read the whole table, so lost or duplicated notifications only
//! change how quickly the fleet converges, never what it converges to.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replica_sync::{MemoryPubsub, ReplicaManager, ReplicaSyncOptions, SqliteReplicaStore, StoreConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replica_sync::Result<()> {
//!     let store = SqliteReplicaStore::connect(&StoreConfig::default()).await?;
//!     let options = ReplicaSyncOptions::for_testing("http://10.0.0.5:8080");
//!
//!     let manager = ReplicaManager::start(Arc::new(store), Arc::new(MemoryPubsub::new()), options).await?;
//!     manager
//!         .set_callback(|snapshot| println!("{} primaries", snapshot.all_primary().len()))
//!         .await;
//!
//!     manager.close().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod prober;
pub mod pubsub;
pub mod replica;
pub mod store;

// Re-exports for convenience
pub use config::{PubsubConfig, ReplicaSyncConfig, ReplicaSyncOptions, StoreConfig};
pub use error::{ReplicaSyncError, Result};
pub use manager::{Callback, ManagerState, ReplicaManager, ReplicaSnapshot};
pub use prober::{
    health_check_url, ping_peer_replica, ProbeOutcome, ProbeReport, Prober, HEALTH_CHECK_PATH,
};
pub use pubsub::{MemoryPubsub, Pubsub, RedisPubsub, Subscription, PUBSUB_EVENT};
pub use replica::Replica;
pub use store::{ReplicaStore, SqliteReplicaStore};
