// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Notification bus.
//!
//! Replicas announce changes to their own row on [`PUBSUB_EVENT`]. The
//! payload is the replica id, but receivers treat every message as "something
//! changed, re-read the table": notifications are advisory and may be lost
//! without breaking correctness, because the heartbeat re-reads the table
//! anyway.
//!
//! # Backends
//!
//! | Backend | Scope | Use |
//! |---------|-------|-----|
//! | [`MemoryPubsub`] | One process | Tests, single-node deployments |
//! | [`RedisPubsub`] | Every process on the Redis | Production |

mod memory;
mod redis_bus;

pub use self::memory::MemoryPubsub;
pub use self::redis_bus::RedisPubsub;

use crate::config::PubsubConfig;
use crate::error::Result;
use crate::store::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Topic every replica publishes and subscribes on.
pub const PUBSUB_EVENT: &str = "replica";

/// Per-subscription buffer. Overflow drops messages, which only delays a
/// refresh that is already pending.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 64;

/// What the manager needs from the notification bus.
pub trait Pubsub: Send + Sync + 'static {
    /// Deliver `payload` to every current subscriber of `topic`.
    fn publish<'a>(&'a self, topic: &'a str, payload: &'a [u8]) -> BoxFuture<'a, ()>;

    /// Start receiving messages published on `topic` from now on.
    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Subscription>;
}

/// A live subscription.
///
/// Messages arrive through [`recv()`](Self::recv). Dropping the subscription
/// (or calling [`close()`](Self::close)) unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
    /// Backend forwarding task, if the backend needs one.
    task: Option<JoinHandle<()>>,
    /// Backend cleanup, run once after the receiver is closed.
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            rx,
            task,
            on_close: None,
        }
    }

    pub(crate) fn with_on_close(mut self, on_close: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(on_close));
        self
    }

    fn release(&mut self) {
        self.rx.close();
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Unsubscribe and wait for the backend task to finish.
    pub async fn close(mut self) {
        self.release();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

/// Build the bus described by `config`.
pub fn connect(config: &PubsubConfig) -> Result<Arc<dyn Pubsub>> {
    config.validate()?;
    match config {
        PubsubConfig::Memory => Ok(Arc::new(MemoryPubsub::new())),
        PubsubConfig::Redis { url } => Ok(Arc::new(RedisPubsub::new(url)?)),
    }
}
