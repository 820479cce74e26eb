// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer connectivity probing.
//!
//! Each refresh round probes every live peer's relay endpoint once. Probes
//! run concurrently, one task per peer, each under its own deadline, and the
//! round waits for all of them before producing a [`ProbeReport`]:
//!
//! ```text
//!            ┌── peer A ── GET /derp/latency-check ── 200 ──► Reachable
//! probe() ───┼── peer B ── GET /derp/latency-check ── 503 ──► Unreachable
//!            └── peer C ── (no answer within peer_timeout) ─► Unreachable
//!                                   │
//!                          join all ▼
//!                             ProbeReport
//! ```
//!
//! Only [`HEALTH_CHECK_PATH`] is ever requested. Redirects are not followed,
//! so a peer cannot steer the prober to another path.
//!
//! There is no retry within a round. A failed probe is recorded and the next
//! round tries again.

use crate::error::{ReplicaSyncError, Result};
use crate::replica::Replica;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// The only route the prober requests on a peer.
pub const HEALTH_CHECK_PATH: &str = "/derp/latency-check";

/// Why a single peer probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("parse relay address {address:?}: {message}")]
    ParseAddress { address: String, message: String },

    #[error("do probe: {0}")]
    Request(#[source] reqwest::Error),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Resolve the health-check URL for a relay address.
///
/// Any path already present on the relay address is replaced.
pub fn health_check_url(relay_address: &str) -> std::result::Result<reqwest::Url, ProbeError> {
    reqwest::Url::parse(relay_address)
        .and_then(|base| base.join(HEALTH_CHECK_PATH))
        .map_err(|e| ProbeError::ParseAddress {
            address: relay_address.to_string(),
            message: e.to_string(),
        })
}

/// Probe one relay address.
///
/// `Ok(())` only for a `200 OK` from [`HEALTH_CHECK_PATH`].
pub async fn ping_peer_replica(
    client: &reqwest::Client,
    relay_address: &str,
) -> std::result::Result<(), ProbeError> {
    let url = health_check_url(relay_address)?;

    let response = client.get(url).send().await.map_err(ProbeError::Request)?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(ProbeError::UnexpectedStatus(status.as_u16()));
    }
    Ok(())
}

/// Result of probing one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable { latency: Duration },
    Unreachable { reason: String },
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable { .. })
    }
}

/// One peer's entry in a [`ProbeReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProbe {
    pub hostname: String,
    pub relay_address: String,
    pub outcome: ProbeOutcome,
}

/// Outcomes of one probing round, keyed by peer id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    peers: BTreeMap<Uuid, PeerProbe>,
}

impl ProbeReport {
    /// Record the outcome for `peer`, replacing any earlier one.
    pub fn record(&mut self, peer: &Replica, outcome: ProbeOutcome) {
        self.peers.insert(
            peer.id,
            PeerProbe {
                hostname: peer.hostname.clone(),
                relay_address: peer.relay_address.clone(),
                outcome,
            },
        );
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&PeerProbe> {
        self.peers.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &PeerProbe)> {
        self.peers.iter()
    }

    /// True when every probed peer answered (vacuously true for no peers).
    pub fn all_reachable(&self) -> bool {
        self.peers.values().all(|p| p.outcome.is_reachable())
    }

    /// Peers that could not be reached, in id order.
    pub fn failures(&self) -> impl Iterator<Item = (&Uuid, &PeerProbe)> {
        self.peers.iter().filter(|(_, p)| !p.outcome.is_reachable())
    }

    pub fn unreachable_count(&self) -> usize {
        self.failures().count()
    }

    /// Text for the `error` column of our own row. Empty when healthy.
    pub fn error_message(&self) -> String {
        let failures: Vec<String> = self
            .failures()
            .map(|(_, p)| {
                let reason = match &p.outcome {
                    ProbeOutcome::Unreachable { reason } => reason.as_str(),
                    ProbeOutcome::Reachable { .. } => "",
                };
                format!("relay {} ({}): {}", p.hostname, p.relay_address, reason)
            })
            .collect();

        if failures.is_empty() {
            String::new()
        } else {
            format!("Failed to dial peers: {}", failures.join(", "))
        }
    }
}

/// Concurrent prober sharing one HTTP client across rounds.
#[derive(Clone)]
pub struct Prober {
    client: reqwest::Client,
    peer_timeout: Duration,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("peer_timeout", &self.peer_timeout)
            .finish()
    }
}

impl Prober {
    /// Build a prober. With `tls_config`, `https` relay addresses are
    /// verified against its roots; without it, the platform defaults apply.
    pub fn new(peer_timeout: Duration, tls_config: Option<Arc<rustls::ClientConfig>>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            // No keep-alive between rounds: idle connections would hold
            // tasks open past close().
            .pool_max_idle_per_host(0);
        if let Some(tls) = tls_config {
            builder = builder.use_preconfigured_tls(tls.as_ref().clone());
        }
        let client = builder
            .build()
            .map_err(|e| ReplicaSyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            peer_timeout,
        })
    }

    pub fn peer_timeout(&self) -> Duration {
        self.peer_timeout
    }

    /// Probe every peer concurrently and wait for all of them.
    ///
    /// Returns [`ReplicaSyncError::Shutdown`] if `shutdown` flips to `true`
    /// first; in-flight probes are aborted before returning.
    pub async fn probe(
        &self,
        peers: &[Replica],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ProbeReport> {
        let mut report = ProbeReport::default();
        if peers.is_empty() {
            return Ok(report);
        }
        if *shutdown.borrow() {
            return Err(ReplicaSyncError::Shutdown);
        }

        let mut set = JoinSet::new();
        for peer in peers {
            // Overwritten when the task reports back.
            report.record(
                peer,
                ProbeOutcome::Unreachable {
                    reason: "probe did not complete".to_string(),
                },
            );

            let client = self.client.clone();
            let peer_timeout = self.peer_timeout;
            let peer_id = peer.id;
            let region_id = peer.region_id;
            let relay_address = peer.relay_address.clone();
            set.spawn(async move {
                let start = Instant::now();
                let outcome =
                    match timeout(peer_timeout, ping_peer_replica(&client, &relay_address)).await {
                        Ok(Ok(())) => ProbeOutcome::Reachable {
                            latency: start.elapsed(),
                        },
                        Ok(Err(e)) => ProbeOutcome::Unreachable {
                            reason: e.to_string(),
                        },
                        Err(_) => ProbeOutcome::Unreachable {
                            reason: ProbeError::Timeout(peer_timeout).to_string(),
                        },
                    };
                (peer_id, region_id, outcome, start.elapsed())
            });
        }

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((peer_id, region_id, outcome, elapsed))) => {
                        crate::metrics::record_probe(region_id, outcome.is_reachable(), elapsed);
                        if let ProbeOutcome::Unreachable { reason } = &outcome {
                            debug!(peer_id = %peer_id, reason = %reason, "Peer unreachable");
                        }
                        if let Some(entry) = report.peers.get_mut(&peer_id) {
                            entry.outcome = outcome;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Probe task failed");
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    set.shutdown().await;
                    return Err(ReplicaSyncError::Shutdown);
                }
            }
        }

        Ok(report)
    }
}
