// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica table persistence.
//!
//! [`ReplicaStore`] is the seam between the manager and whatever relational
//! store every replica shares. [`SqliteReplicaStore`] implements it on
//! SQLite through `sqlx`.
//!
//! # Semantics
//!
//! - `insert` creates a row and fails if the id already exists.
//! - `update` rewrites the mutable columns of an existing row and fails with
//!   [`ReplicaSyncError::NotFound`] when the row is gone. `created_at` is
//!   never touched and `updated_at` never moves backwards.
//! - `delete_updated_before` is a single statement: the age predicate is
//!   evaluated by the database at delete time, so a row that was refreshed
//!   concurrently survives even if the caller's view of it was stale.
//!
//! # SQLite Busy Handling
//!
//! Many replicas share the same file, so SQLITE_BUSY/SQLITE_LOCKED is
//! expected under contention. Every statement goes through
//! [`execute_with_retry`], which backs off exponentially:
//!
//! ```text
//! attempt 1 ── busy ──► sleep 10ms ──► attempt 2 ── busy ──► sleep 20ms ...
//!                                           (max 5 attempts, 500ms cap)
//! ```

use crate::config::StoreConfig;
use crate::error::{ReplicaSyncError, Result};
use crate::replica::{from_micros, Replica};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// What the manager needs from the shared replica table.
///
/// Implementations must tolerate concurrent callers from many processes.
pub trait ReplicaStore: Send + Sync + 'static {
    /// Insert a new row. Fails if a row with the same id exists.
    fn insert(&self, replica: Replica) -> BoxFuture<'_, Replica>;

    /// Update the mutable columns of an existing row.
    ///
    /// Returns [`ReplicaSyncError::NotFound`] when the row does not exist.
    fn update(&self, replica: Replica) -> BoxFuture<'_, Replica>;

    /// Every row, in creation order.
    fn list(&self) -> BoxFuture<'_, Vec<Replica>>;

    /// Delete rows whose `updated_at` precedes `cutoff`. Returns rows deleted.
    fn delete_updated_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, u64>;

    /// Measure a store round-trip.
    fn ping(&self) -> BoxFuture<'_, Duration> {
        Box::pin(async { Ok(Duration::ZERO) })
    }
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Check if an error is a primary key violation
fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Row shape as stored. Timestamps are microseconds since the Unix epoch.
#[derive(Debug, sqlx::FromRow)]
struct ReplicaRow {
    id: String,
    created_at: i64,
    started_at: i64,
    stopped_at: Option<i64>,
    updated_at: i64,
    hostname: String,
    region_id: i32,
    relay_address: String,
    database_latency: i32,
    version: String,
    error: String,
    is_primary: bool,
}

impl TryFrom<ReplicaRow> for Replica {
    type Error = ReplicaSyncError;

    fn try_from(row: ReplicaRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id).map_err(|e| {
            ReplicaSyncError::store_msg("decode", format!("invalid replica id {:?}: {}", row.id, e))
        })?;
        Ok(Replica {
            id,
            created_at: from_micros(row.created_at),
            started_at: from_micros(row.started_at),
            stopped_at: row.stopped_at.map(from_micros),
            updated_at: from_micros(row.updated_at),
            hostname: row.hostname,
            region_id: row.region_id,
            relay_address: row.relay_address,
            database_latency: row.database_latency,
            version: row.version,
            error: row.error,
            primary: row.is_primary,
        })
    }
}

const REPLICA_COLUMNS: &str = "id, created_at, started_at, stopped_at, updated_at, hostname, \
     region_id, relay_address, database_latency, version, error, is_primary";

/// Replica table backed by SQLite.
///
/// Cloning is cheap: clones share the connection pool.
#[derive(Clone)]
pub struct SqliteReplicaStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteReplicaStore {
    /// Open (or create) the database and the replica table.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let path_str = config.sqlite_path.clone();
        info!(path = %path_str, "Initializing replica store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicaSyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| ReplicaSyncError::store("connect", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replicas (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                stopped_at INTEGER,
                updated_at INTEGER NOT NULL,
                hostname TEXT NOT NULL DEFAULT '',
                region_id INTEGER NOT NULL DEFAULT 0,
                relay_address TEXT NOT NULL DEFAULT '',
                database_latency INTEGER NOT NULL DEFAULT 0,
                version TEXT NOT NULL DEFAULT '',
                error TEXT NOT NULL DEFAULT '',
                is_primary INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| ReplicaSyncError::store("create_table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS replicas_updated_at ON replicas (updated_at)")
            .execute(&pool)
            .await
            .map_err(|e| ReplicaSyncError::store("create_index", e))?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path, "Replica store closed");
    }

    async fn insert_row(&self, replica: Replica) -> Result<Replica> {
        let pool = &self.pool;
        let sql = format!(
            "INSERT INTO replicas ({REPLICA_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {REPLICA_COLUMNS}"
        );

        let row: ReplicaRow = execute_with_retry("replica_insert", || async {
            sqlx::query_as::<_, ReplicaRow>(&sql)
                .bind(replica.id.to_string())
                .bind(replica.created_at.timestamp_micros())
                .bind(replica.started_at.timestamp_micros())
                .bind(replica.stopped_at.map(|t| t.timestamp_micros()))
                .bind(replica.updated_at.timestamp_micros())
                .bind(&replica.hostname)
                .bind(replica.region_id)
                .bind(&replica.relay_address)
                .bind(replica.database_latency)
                .bind(&replica.version)
                .bind(&replica.error)
                .bind(replica.primary)
                .fetch_one(pool)
                .await
        })
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ReplicaSyncError::store_msg("insert", format!("replica {} already exists", replica.id))
            } else {
                ReplicaSyncError::store("insert", e)
            }
        })?;

        debug!(replica_id = %replica.id, "Inserted replica");
        row.try_into()
    }

    async fn update_row(&self, replica: Replica) -> Result<Replica> {
        let pool = &self.pool;
        let sql = format!(
            "UPDATE replicas SET \
                 started_at = ?, \
                 stopped_at = ?, \
                 updated_at = MAX(updated_at, ?), \
                 hostname = ?, \
                 region_id = ?, \
                 relay_address = ?, \
                 database_latency = ?, \
                 version = ?, \
                 error = ?, \
                 is_primary = ? \
             WHERE id = ? \
             RETURNING {REPLICA_COLUMNS}"
        );

        let row: Option<ReplicaRow> = execute_with_retry("replica_update", || async {
            sqlx::query_as::<_, ReplicaRow>(&sql)
                .bind(replica.started_at.timestamp_micros())
                .bind(replica.stopped_at.map(|t| t.timestamp_micros()))
                .bind(replica.updated_at.timestamp_micros())
                .bind(&replica.hostname)
                .bind(replica.region_id)
                .bind(&replica.relay_address)
                .bind(replica.database_latency)
                .bind(&replica.version)
                .bind(&replica.error)
                .bind(replica.primary)
                .bind(replica.id.to_string())
                .fetch_optional(pool)
                .await
        })
        .await
        .map_err(|e| ReplicaSyncError::store("update", e))?;

        match row {
            Some(row) => row.try_into(),
            None => Err(ReplicaSyncError::NotFound(replica.id)),
        }
    }

    async fn list_rows(&self) -> Result<Vec<Replica>> {
        let pool = &self.pool;
        let sql = format!("SELECT {REPLICA_COLUMNS} FROM replicas ORDER BY created_at, id");

        let rows: Vec<ReplicaRow> = execute_with_retry("replica_list", || async {
            sqlx::query_as::<_, ReplicaRow>(&sql).fetch_all(pool).await
        })
        .await
        .map_err(|e| ReplicaSyncError::store("list", e))?;

        rows.into_iter().map(Replica::try_from).collect()
    }

    async fn delete_rows_updated_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let pool = &self.pool;
        let cutoff_micros = cutoff.timestamp_micros();

        let result = execute_with_retry("replica_delete", || async {
            sqlx::query("DELETE FROM replicas WHERE updated_at < ?")
                .bind(cutoff_micros)
                .execute(pool)
                .await
        })
        .await
        .map_err(|e| ReplicaSyncError::store("delete_updated_before", e))?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Deleted stale replicas");
        }
        Ok(deleted)
    }

    /// Round-trip of the last attempt only; busy backoff is not latency.
    async fn ping_db(&self) -> Result<Duration> {
        let pool = &self.pool;
        execute_with_retry("replica_ping", || async {
            let start = Instant::now();
            sqlx::query("SELECT 1 FROM replicas LIMIT 1")
                .fetch_optional(pool)
                .await
                .map(|_| start.elapsed())
        })
        .await
        .map_err(|e| ReplicaSyncError::store("ping", e))
    }
}

impl ReplicaStore for SqliteReplicaStore {
    fn insert(&self, replica: Replica) -> BoxFuture<'_, Replica> {
        Box::pin(self.insert_row(replica))
    }

    fn update(&self, replica: Replica) -> BoxFuture<'_, Replica> {
        Box::pin(self.update_row(replica))
    }

    fn list(&self) -> BoxFuture<'_, Vec<Replica>> {
        Box::pin(self.list_rows())
    }

    fn delete_updated_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, u64> {
        Box::pin(self.delete_rows_updated_before(cutoff))
    }

    fn ping(&self) -> BoxFuture<'_, Duration> {
        Box::pin(self.ping_db())
    }
}
