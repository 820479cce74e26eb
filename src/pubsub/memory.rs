// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process bus.

use super::{Pubsub, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::Result;
use crate::store::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

type Topics = HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>;

/// Fan-out bus living in this process.
///
/// Publishing never blocks: a subscriber whose buffer is full misses the
/// message. Closed subscribers are pruned when they unsubscribe and again on
/// every publish.
#[derive(Default)]
pub struct MemoryPubsub {
    // Never held across an await.
    topics: Arc<Mutex<Topics>>,
}

fn lock(topics: &Mutex<Topics>) -> MutexGuard<'_, Topics> {
    topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop closed senders on `topic`, and the topic itself once empty.
fn prune(topics: &mut Topics, topic: &str) {
    if let Some(subscribers) = topics.get_mut(topic) {
        subscribers.retain(|tx| !tx.is_closed());
        if subscribers.is_empty() {
            topics.remove(topic);
        }
    }
}

impl MemoryPubsub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered subscribers on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.topics).get(topic).map_or(0, Vec::len)
    }

    async fn publish_inner(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut topics = lock(&self.topics);
        let Some(subscribers) = topics.get_mut(topic) else {
            return Ok(());
        };

        subscribers.retain(|tx| match tx.try_send(payload.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(topic, "Subscriber buffer full, dropping notification");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            topics.remove(topic);
        }
        Ok(())
    }

    async fn subscribe_inner(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        lock(&self.topics)
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        let topics: Weak<Mutex<Topics>> = Arc::downgrade(&self.topics);
        let topic = topic.to_string();
        Ok(Subscription::new(rx, None).with_on_close(move || {
            if let Some(topics) = topics.upgrade() {
                prune(&mut lock(&topics), &topic);
            }
        }))
    }
}

impl Pubsub for MemoryPubsub {
    fn publish<'a>(&'a self, topic: &'a str, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(self.publish_inner(topic, payload))
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Subscription> {
        Box::pin(self.subscribe_inner(topic))
    }
}
