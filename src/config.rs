//! Configuration for replica discovery.
//!
//! [`ReplicaSyncOptions`] is what [`ReplicaManager::start()`](crate::ReplicaManager::start)
//! takes. [`ReplicaSyncConfig`] bundles it with the store and bus settings a
//! daemon needs to build the collaborators, and can be deserialized from
//! JSON/YAML.
//!
//! # Quick Start
//!
//! ```rust
//! use replica_sync::config::ReplicaSyncOptions;
//! use std::time::Duration;
//!
//! let options = ReplicaSyncOptions {
//!     relay_address: "http://10.0.0.5:8080".into(),
//!     update_interval: Duration::from_secs(2),
//!     ..Default::default()
//! };
//! assert!(options.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicaSyncConfig
//! ├── options: ReplicaSyncOptions
//! │   ├── id / hostname             # identity (generated when absent)
//! │   ├── relay_address             # where peers probe us
//! │   ├── region_id / primary       # classification
//! │   ├── peer_timeout              # per-peer probe deadline
//! │   ├── update_interval           # heartbeat period
//! │   ├── cleanup_interval          # reaper period and TTL
//! │   └── tls_config                # runtime only, not serialized
//! ├── store: StoreConfig            # SQLite replica table
//! └── pubsub: PubsubConfig          # memory or Redis
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "options": {
//!     "relay_address": "https://replica-1.internal:8443",
//!     "region_id": 1,
//!     "peer_timeout": "3s",
//!     "update_interval": "5s",
//!     "cleanup_interval": "30m"
//!   },
//!   "store": { "sqlite_path": "/var/lib/app/replicas.db" },
//!   "pubsub": { "backend": "redis", "url": "redis://127.0.0.1:6379" }
//! }
//! ```

use crate::error::{ReplicaSyncError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a daemon needs to run replica discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaSyncConfig {
    #[serde(default)]
    pub options: ReplicaSyncOptions,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pubsub: PubsubConfig,
}

impl ReplicaSyncConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ReplicaSyncError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.options.validate()?;
        self.store.validate()?;
        self.pubsub.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicaSyncOptions: identity, intervals and probe settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for one replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSyncOptions {
    /// Fixed replica id. A random v4 id is generated when absent.
    #[serde(default)]
    pub id: Option<Uuid>,

    /// Origin label. Defaults to the OS hostname.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Address at which peers reach our relay/health endpoint.
    #[serde(default)]
    pub relay_address: String,

    /// Region classification; `regional()` returns peers with the same value.
    #[serde(default)]
    pub region_id: i32,

    /// Whether this replica takes part in full-cluster convergence.
    #[serde(default = "default_true")]
    pub primary: bool,

    /// Deadline for a single peer probe.
    #[serde(default = "default_peer_timeout", with = "humantime_serde")]
    pub peer_timeout: Duration,

    /// Heartbeat period.
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,

    /// Reaper period. Rows not updated within this window are deleted.
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Trust material for probing peers over TLS. Plaintext when absent.
    #[serde(skip)]
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

fn default_true() -> bool {
    true
}

fn default_peer_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_update_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_cleanup_interval() -> Duration {
    // Long on purpose: only dead replicas are left for the reaper.
    Duration::from_secs(30 * 60)
}

/// Upper bound for every configured duration. Timer deadlines are computed as
/// `now + period` and must not overflow.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn check_duration(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(ReplicaSyncError::Config(format!("{name} must be non-zero")));
    }
    if value > MAX_DURATION {
        return Err(ReplicaSyncError::Config(format!(
            "{name} must be at most {MAX_DURATION:?}"
        )));
    }
    Ok(())
}

impl Default for ReplicaSyncOptions {
    fn default() -> Self {
        Self {
            id: None,
            hostname: None,
            relay_address: String::new(),
            region_id: 0,
            primary: true,
            peer_timeout: default_peer_timeout(),
            update_interval: default_update_interval(),
            cleanup_interval: default_cleanup_interval(),
            tls_config: None,
        }
    }
}

impl ReplicaSyncOptions {
    /// Options for tests: defaults plus a relay address.
    pub fn for_testing(relay_address: &str) -> Self {
        Self {
            relay_address: relay_address.to_string(),
            ..Default::default()
        }
    }

    /// Reject values the background timers cannot run with.
    pub fn validate(&self) -> Result<()> {
        check_duration("peer_timeout", self.peer_timeout)?;
        check_duration("update_interval", self.update_interval)?;
        check_duration("cleanup_interval", self.cleanup_interval)
    }

    /// The configured hostname, or the OS hostname.
    pub fn resolved_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite replica table
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Pool size. Replicas in one process share the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long SQLite itself waits on a locked database before failing.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,
}

fn default_sqlite_path() -> String {
    "replicas.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            max_connections: default_max_connections(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    /// Store config pointing at a specific file (tests use a temp dir).
    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sqlite_path.trim().is_empty() {
            return Err(ReplicaSyncError::Config("sqlite_path must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ReplicaSyncError::Config("max_connections must be at least 1".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PubsubConfig: notification bus backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Notification bus backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum PubsubConfig {
    /// In-process bus; only replicas inside one process see each other.
    Memory,
    /// Redis PUBLISH/SUBSCRIBE.
    Redis {
        /// Example: `"redis://127.0.0.1:6379"`
        url: String,
    },
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl PubsubConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Memory => Ok(()),
            Self::Redis { url } if url.starts_with("redis://") || url.starts_with("rediss://") => {
                Ok(())
            }
            Self::Redis { url } => Err(ReplicaSyncError::Config(format!(
                "Invalid Redis URL: {}",
                url
            ))),
        }
    }
}
