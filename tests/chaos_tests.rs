// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify that failing or hanging collaborators never panic,
//! deadlock or leak background tasks, and that a single bad peer never
//! affects the view of the others.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{eventually, init_tracing, temp_store, FailingPubsub, FakePeer, FlakyStore, HungPeer};
use replica_sync::replica::now;
use replica_sync::{
    ManagerState, MemoryPubsub, Replica, ReplicaManager, ReplicaStore, ReplicaSyncError,
    ReplicaSyncOptions, PUBSUB_EVENT,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

/// A peer row that stays fresh for the whole test without heartbeating.
fn live_peer(relay_address: &str) -> Replica {
    let mut row = Replica::for_testing(relay_address);
    row.updated_at = now() + chrono::Duration::hours(1);
    row
}

// =============================================================================
// Peer Failures
// =============================================================================

/// Test: A peer that accepts connections but never answers only costs its timeout
#[tokio::test]
async fn hung_peer_does_not_block_round() {
    init_tracing();
    let (_dir, store) = temp_store().await;
    let pubsub = Arc::new(MemoryPubsub::new());
    let hung = HungPeer::start().await;
    let fake = FakePeer::start().await;

    let hung_row = Replica::for_testing(&hung.relay_address());
    let good_row = Replica::for_testing(&fake.relay_address());
    store.insert(hung_row.clone()).await.unwrap();
    store.insert(good_row.clone()).await.unwrap();

    let options = ReplicaSyncOptions {
        peer_timeout: Duration::from_millis(200),
        ..ReplicaSyncOptions::for_testing("")
    };

    let started = Instant::now();
    let manager = ReplicaManager::start(store, pubsub, options).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let snapshot = manager.snapshot();
    assert!(snapshot.probe().get(&good_row.id).unwrap().outcome.is_reachable());
    assert!(!snapshot.probe().get(&hung_row.id).unwrap().outcome.is_reachable());

    let error = &snapshot.self_replica().error;
    assert!(error.contains(&hung.relay_address()), "error: {error}");
    assert!(error.contains("timed out after 200ms"), "error: {error}");
    assert!(!error.contains(&fake.relay_address()), "error: {error}");

    // Both peers are still part of the view.
    assert_eq!(manager.regional().len(), 2);

    let closing = Instant::now();
    manager.close().await.unwrap();
    assert!(closing.elapsed() < Duration::from_secs(5));
}

/// Test: close() cancels a round stuck on slow probes
#[tokio::test]
async fn close_cancels_in_flight_probes() {
    let (_dir, store) = temp_store().await;
    let pubsub = Arc::new(MemoryPubsub::new());

    let options = ReplicaSyncOptions {
        peer_timeout: Duration::from_secs(60),
        update_interval: Duration::from_millis(10),
        ..ReplicaSyncOptions::for_testing("")
    };
    let manager = ReplicaManager::start(store.clone(), pubsub, options).await.unwrap();

    // Added after startup so only background rounds hit it.
    let hung = HungPeer::start().await;
    store.insert(live_peer(&hung.relay_address())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let closing = Instant::now();
    manager.close().await.unwrap();
    assert!(closing.elapsed() < Duration::from_secs(5));
    assert_eq!(manager.state(), ManagerState::Stopped);
}

/// Test: A peer row with garbage in its relay address is reported, not fatal
#[tokio::test]
async fn unparseable_relay_address_is_reported() {
    let (_dir, store) = temp_store().await;
    let pubsub = Arc::new(MemoryPubsub::new());
    store.insert(Replica::for_testing("::not a url::")).await.unwrap();

    let manager = ReplicaManager::start(store, pubsub, ReplicaSyncOptions::for_testing(""))
        .await
        .unwrap();

    let error = manager.self_replica().error;
    assert!(error.contains("parse relay address"), "error: {error}");
    manager.close().await.unwrap();
}

// =============================================================================
// Store Failures
// =============================================================================

/// Test: Startup fails if our row cannot be written, and leaves nothing behind
#[tokio::test]
async fn store_failure_at_startup_is_fatal() {
    let (_dir, inner) = temp_store().await;
    let store = Arc::new(FlakyStore::new(inner.clone()));
    store.fail_insert.store(true, Ordering::SeqCst);
    let pubsub = Arc::new(MemoryPubsub::new());

    let err = ReplicaManager::start(store.clone(), pubsub.clone(), ReplicaSyncOptions::for_testing(""))
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicaSyncError::Store { .. }), "got {err}");
    assert!(err.to_string().contains("injected failure"));

    // The subscription taken during startup was released.
    assert_eq!(pubsub.subscriber_count(PUBSUB_EVENT).await, 0);
    assert!(inner.list().await.unwrap().is_empty());
}

/// Test: A failed first round is fatal too
#[tokio::test]
async fn store_list_failure_at_startup_is_fatal() {
    let (_dir, inner) = temp_store().await;
    let store = Arc::new(FlakyStore::new(inner));
    store.fail_list.store(true, Ordering::SeqCst);

    let err = ReplicaManager::start(store, Arc::new(MemoryPubsub::new()), ReplicaSyncOptions::for_testing(""))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("list"));
}

/// Test: Store outages after startup only fail rounds; the manager keeps going
#[tokio::test]
async fn store_outage_after_startup_recovers() {
    init_tracing();
    let (_dir, inner) = temp_store().await;
    let store = Arc::new(FlakyStore::new(inner.clone()));

    let options = ReplicaSyncOptions {
        update_interval: Duration::from_millis(10),
        ..ReplicaSyncOptions::for_testing("")
    };
    let manager = ReplicaManager::start(store.clone(), Arc::new(MemoryPubsub::new()), options)
        .await
        .unwrap();

    store.fail_list.store(true, Ordering::SeqCst);
    assert!(manager.refresh().await.is_err());
    // Rounds are serialized: every round after this one fails at list().
    let before = manager.snapshot();

    // Failed rounds leave the last committed snapshot in place.
    let calls = store.list_calls.load(Ordering::SeqCst);
    assert!(eventually(WAIT, || store.list_calls.load(Ordering::SeqCst) > calls + 3).await);
    assert!(Arc::ptr_eq(&before, &manager.snapshot()));
    assert!(manager.is_running());

    inner.insert(live_peer("")).await.unwrap();
    store.fail_list.store(false, Ordering::SeqCst);
    assert!(eventually(WAIT, || manager.regional().len() == 1).await);

    manager.close().await.unwrap();
}

/// Test: The final stopped_at write failing is the only thing close() reports
#[tokio::test]
async fn close_reports_final_update_failure() {
    let (_dir, inner) = temp_store().await;
    let store = Arc::new(FlakyStore::new(inner.clone()));
    let manager = ReplicaManager::start(store.clone(), Arc::new(MemoryPubsub::new()), ReplicaSyncOptions::for_testing(""))
        .await
        .unwrap();

    store.fail_update.store(true, Ordering::SeqCst);
    let err = manager.close().await.unwrap_err();
    assert!(matches!(err, ReplicaSyncError::Store { .. }));
    assert_eq!(manager.state(), ManagerState::Stopped);

    // Second close is a no-op.
    manager.close().await.unwrap();
}

/// Test: The reaper never removes a row refreshed after the cutoff was computed
#[tokio::test]
async fn reaper_predicate_evaluated_at_delete_time() {
    let (_dir, store) = temp_store().await;

    let mut row = Replica::for_testing("");
    row.updated_at = now() - chrono::Duration::hours(1);
    store.insert(row.clone()).await.unwrap();

    // Cutoff computed from a stale view of the row...
    let cutoff = now() - chrono::Duration::minutes(1);

    // ...then the owner heartbeats before the delete runs.
    row.updated_at = now();
    store.update(row.clone()).await.unwrap();

    assert_eq!(store.delete_updated_before(cutoff).await.unwrap(), 0);
    assert_eq!(store.list().await.unwrap().len(), 1);
}

/// Test: Many processes racing on the same store all register exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_no_duplicates() {
    let (_dir, store) = temp_store().await;
    let pubsub = Arc::new(MemoryPubsub::new());

    let starts = (0..10).map(|_| {
        let store = store.clone();
        let pubsub = pubsub.clone();
        async move { ReplicaManager::start(store, pubsub, ReplicaSyncOptions::for_testing("")).await }
    });
    let managers: Vec<ReplicaManager> = futures::future::join_all(starts)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let rows = store.list().await.unwrap();
    assert_eq!(rows.len(), 10);
    for manager in &managers {
        assert_eq!(rows.iter().filter(|r| r.id == manager.id()).count(), 1);
    }

    for manager in &managers {
        manager.close().await.unwrap();
    }
}

// =============================================================================
// Bus Failures
// =============================================================================

/// Test: A bus that cannot publish does not stop registration or refreshes
#[tokio::test]
async fn publish_failure_is_not_fatal() {
    let (_dir, store) = temp_store().await;
    let pubsub = Arc::new(FailingPubsub::new());

    let options = ReplicaSyncOptions {
        update_interval: Duration::from_millis(10),
        ..ReplicaSyncOptions::for_testing("")
    };
    let manager = ReplicaManager::start(store.clone(), pubsub.clone(), options)
        .await
        .unwrap();
    assert!(manager.is_running());

    // Heartbeat alone still discovers peers.
    store.insert(live_peer("")).await.unwrap();
    assert!(eventually(WAIT, || manager.regional().len() == 1).await);

    // Tasks are stopped even though the final notification fails.
    let err = manager.close().await.unwrap_err();
    assert!(matches!(err, ReplicaSyncError::Pubsub { .. }));
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(pubsub.subscriber_count(PUBSUB_EVENT).await, 0);
}

// =============================================================================
// Callback Discipline
// =============================================================================

/// Test: Concurrent refresh triggers never run the callback concurrently
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_never_runs_concurrently() {
    let (_dir, store) = temp_store().await;
    let pubsub = Arc::new(MemoryPubsub::new());
    let manager = Arc::new(
        ReplicaManager::start(store, pubsub, ReplicaSyncOptions::for_testing(""))
            .await
            .unwrap(),
    );

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let in_flight = in_flight.clone();
        let max_seen = max_seen.clone();
        let calls = calls.clone();
        manager
            .set_callback(move |_snapshot| {
                let now_in = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now_in, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;
    }

    let rounds: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh().await.map(|_| ()) })
        })
        .collect();
    for round in rounds {
        round.await.unwrap().unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    // Once on set_callback, once per round.
    assert!(calls.load(Ordering::SeqCst) >= 17);

    manager.close().await.unwrap();
}

/// Test: Snapshots are only ever replaced by complete rounds
#[tokio::test]
async fn snapshot_always_reflects_complete_round() {
    let (_dir, store) = temp_store().await;
    let pubsub = Arc::new(MemoryPubsub::new());
    let fake = FakePeer::start().await;
    for _ in 0..5 {
        store.insert(Replica::for_testing(&fake.relay_address())).await.unwrap();
    }

    let manager = ReplicaManager::start(store, pubsub, ReplicaSyncOptions::for_testing(""))
        .await
        .unwrap();
    let mut rx = manager.subscribe();

    for _ in 0..5 {
        manager.refresh().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        // Every listed peer was probed in the same round.
        assert_eq!(snapshot.peers().len(), 5);
        assert_eq!(snapshot.probe().len(), 5);
        for peer in snapshot.peers() {
            assert!(snapshot.probe().get(&peer.id).is_some());
        }
    }

    manager.close().await.unwrap();
    fake.assert_only_health_checks().await;
}
