// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for replica discovery.
//!
//! Errors are categorized by the collaborator they came from (the replica
//! store, the notification bus, a peer) and carry enough context to tell an
//! operator which operation failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal at startup | Description |
//! |------------|-----------|------------------|-------------|
//! | `Store` | Yes | Yes | Replica table insert/update/list/delete failed |
//! | `NotFound` | No | No | Our own row was reaped; re-inserted by the next round |
//! | `Pubsub` | Yes | No | Publish/subscribe failed; convergence is only delayed |
//! | `Config` | No | Yes | Options are invalid |
//! | `InvalidState` | No | - | Lifecycle violation |
//! | `Shutdown` | No | - | The manager is closing |
//!
//! Peer failures are not errors at this level. They never escape a refresh
//! round and are folded into the `error` column of our own replica row
//! (see `ProbeReport::error_message`).

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for replica sync operations.
pub type Result<T> = std::result::Result<T, ReplicaSyncError>;

/// Errors that can occur while registering, refreshing or reaping replicas.
#[derive(Error, Debug)]
pub enum ReplicaSyncError {
    /// Replica store (SQLite) error.
    ///
    /// Surfaced to whoever triggered the operation. `ReplicaManager::start`
    /// fails with this when the initial registration cannot be written.
    #[error("Store error ({operation}): {message}")]
    Store {
        operation: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// The replica row does not exist (it was reaped or never inserted).
    #[error("Replica {0} not found")]
    NotFound(Uuid),

    /// Notification bus error.
    ///
    /// Logged and otherwise ignored by the manager; a lost notification only
    /// delays convergence until the next heartbeat.
    #[error("Pubsub error ({operation}): {message}")]
    Pubsub {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl ReplicaSyncError {
    /// Create a store error from a sqlx::Error
    pub fn store(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Store {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a store error without source
    pub fn store_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a pubsub error from a redis::RedisError
    pub fn pubsub(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Pubsub {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a pubsub error without source
    pub fn pubsub_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pubsub {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    ///
    /// A failed round with a retryable error is simply run again on the next
    /// trigger.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            Self::Pubsub { .. } => true,
            Self::NotFound(_) => false, // Caller must re-insert, not retry
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }

    /// True when the error only means the manager is shutting down.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl From<sqlx::Error> for ReplicaSyncError {
    fn from(e: sqlx::Error) -> Self {
        Self::store("unknown", e)
    }
}

impl From<redis::RedisError> for ReplicaSyncError {
    fn from(e: redis::RedisError) -> Self {
        Self::pubsub("unknown", e)
    }
}
