// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis PUBLISH/SUBSCRIBE bus.
//!
//! Publishing goes through a lazily created `ConnectionManager`, which
//! reconnects on its own and is cheap to clone. Each subscription holds a
//! dedicated pub/sub connection drained by a forwarding task; aborting the
//! task drops the connection, which unsubscribes.

use super::{Pubsub, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::{ReplicaSyncError, Result};
use crate::store::BoxFuture;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Upper bound for establishing a Redis connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Notification bus on a Redis server.
pub struct RedisPubsub {
    client: Client,
    url: String,
    /// Publish connection (None until first use).
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisPubsub {
    /// Parse `url`. No connection is made until the first publish/subscribe.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            ReplicaSyncError::Config(format!("Invalid Redis URL: {}", e))
        })?;
        Ok(Self {
            client,
            url: url.to_string(),
            conn: RwLock::new(None),
        })
    }

    /// Redis URL (for diagnostics).
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.conn.read().await.clone() {
            return Ok(conn);
        }

        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.clone() {
            return Ok(conn);
        }

        let conn = timeout(CONNECT_TIMEOUT, self.client.get_connection_manager())
            .await
            .map_err(|_| {
                ReplicaSyncError::pubsub_msg(
                    "connect",
                    format!("timed out after {}ms", CONNECT_TIMEOUT.as_millis()),
                )
            })?
            .map_err(|e| ReplicaSyncError::pubsub("connect", e))?;

        info!(url = %self.url, "Connected to Redis bus");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn publish_inner(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| ReplicaSyncError::pubsub("PUBLISH", e))?;
        debug!(topic, receivers, "Published notification");
        Ok(())
    }

    async fn subscribe_inner(&self, topic: &str) -> Result<Subscription> {
        let mut pubsub = timeout(CONNECT_TIMEOUT, self.client.get_async_pubsub())
            .await
            .map_err(|_| {
                ReplicaSyncError::pubsub_msg(
                    "subscribe",
                    format!("timed out after {}ms", CONNECT_TIMEOUT.as_millis()),
                )
            })?
            .map_err(|e| ReplicaSyncError::pubsub("subscribe", e))?;

        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| ReplicaSyncError::pubsub("SUBSCRIBE", e))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let topic_owned = topic.to_string();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match tx.try_send(msg.get_payload_bytes().to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(topic = %topic_owned, "Subscriber buffer full, dropping notification");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            if !tx.is_closed() {
                warn!(topic = %topic_owned, "Redis subscription stream ended");
            }
        });

        debug!(topic, "Subscribed on Redis bus");
        Ok(Subscription::new(rx, Some(task)))
    }
}

impl Pubsub for RedisPubsub {
    fn publish<'a>(&'a self, topic: &'a str, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(self.publish_inner(topic, payload))
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Subscription> {
        Box::pin(self.subscribe_inner(topic))
    }
}
