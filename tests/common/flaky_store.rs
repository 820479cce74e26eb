//! Collaborators with injectable failures.
//!
//! [`FlakyStore`] wraps a real SQLite store and fails selected operations
//! while a switch is on. [`FailingPubsub`] delivers subscriptions normally
//! but refuses every publish.

use chrono::{DateTime, Utc};
use replica_sync::store::BoxFuture;
use replica_sync::{
    MemoryPubsub, Pubsub, Replica, ReplicaStore, ReplicaSyncError, SqliteReplicaStore, Subscription,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store wrapper whose operations can be switched to fail.
pub struct FlakyStore {
    inner: Arc<SqliteReplicaStore>,
    pub fail_insert: AtomicBool,
    pub fail_list: AtomicBool,
    pub fail_update: AtomicBool,
    pub list_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteReplicaStore>) -> Self {
        Self {
            inner,
            fail_insert: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
        }
    }

    fn injected(operation: &str) -> ReplicaSyncError {
        ReplicaSyncError::store_msg(operation, "injected failure")
    }
}

impl ReplicaStore for FlakyStore {
    fn insert(&self, replica: Replica) -> BoxFuture<'_, Replica> {
        Box::pin(async move {
            if self.fail_insert.load(Ordering::SeqCst) {
                return Err(Self::injected("insert"));
            }
            self.inner.insert(replica).await
        })
    }

    fn update(&self, replica: Replica) -> BoxFuture<'_, Replica> {
        Box::pin(async move {
            if self.fail_update.load(Ordering::SeqCst) {
                return Err(Self::injected("update"));
            }
            self.inner.update(replica).await
        })
    }

    fn list(&self) -> BoxFuture<'_, Vec<Replica>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(Self::injected("list"));
            }
            self.inner.list().await
        })
    }

    fn delete_updated_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, u64> {
        self.inner.delete_updated_before(cutoff)
    }

    fn ping(&self) -> BoxFuture<'_, Duration> {
        self.inner.ping()
    }
}

/// Bus that subscribes fine but never manages to publish.
#[derive(Default)]
pub struct FailingPubsub {
    inner: MemoryPubsub,
}

impl FailingPubsub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.subscriber_count(topic).await
    }
}

impl Pubsub for FailingPubsub {
    fn publish<'a>(&'a self, _topic: &'a str, _payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async { Err(ReplicaSyncError::pubsub_msg("PUBLISH", "injected failure")) })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Subscription> {
        self.inner.subscribe(topic)
    }
}
