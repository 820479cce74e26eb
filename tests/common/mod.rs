//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Fake peers serving the health endpoint (plain HTTP and TLS)
//! - Temporary SQLite stores and a store wrapper with injectable failures
//! - Polling helpers

#![allow(dead_code)]

pub mod containers;
pub mod fake_peer;
pub mod flaky_store;

pub use containers::*;
pub use fake_peer::*;
pub use flaky_store::*;

use replica_sync::{StoreConfig, SqliteReplicaStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Route `RUST_LOG` output through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A SQLite store in a fresh temp dir. Keep the `TempDir` alive.
pub async fn temp_store() -> (TempDir, Arc<SqliteReplicaStore>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replicas.db");
    let store = SqliteReplicaStore::connect(&StoreConfig::at_path(path.to_string_lossy()))
        .await
        .unwrap();
    (dir, Arc::new(store))
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
