//! Integration tests for leader election across several simulated processes.
//!
//! These tests validate correct behavior of multiple election agents sharing
//! one coordination store, including:
//! - Mutual exclusion (only one agent wins a race for an empty key)
//! - Lease expiry and notification of watchers
//! - Graceful step-down versus TTL-driven expiry
//! - Follower wake-up issuing exactly one new attempt
//! - Failover from one leader to another
//! - Connectivity failures and request timeouts
//! - Graceful shutdown behavior
//!
//! # Running these tests
//!
//! ```bash
//! cargo test --package le-core --test election_integration_tests
//! ```
//!
//! These tests use the in-memory coordination store and do not require etcd.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use le_core::coordination::{
    CoordinationClient, Lease, MockCoordinationService, WatchCallback, WatchEvent,
};
use le_core::election::{
    ElectionAgent, ElectionConfig, ElectionError, ElectionOutcome, ElectionState, FollowReason,
    Role,
};

const KEY: &str = "/key/leader";

// ============================================================================
// Test Harness
// ============================================================================

/// Short intervals so paused-clock tests stay quick to reason about.
fn fast_config(instance_id: &str) -> ElectionConfig {
    ElectionConfig::new(instance_id)
        .with_lease_ttl(Duration::from_secs(2))
        .with_leader_work_interval(Duration::from_millis(100))
        .with_follower_poll_interval(Duration::from_millis(200))
        .with_cooldown(Duration::from_millis(100))
        .with_request_timeout(Duration::from_millis(500))
}

fn agent(config: ElectionConfig, service: &MockCoordinationService) -> Arc<ElectionAgent> {
    Arc::new(ElectionAgent::new(config, Arc::new(service.clone())))
}

fn spawn_run(agent: &Arc<ElectionAgent>) -> JoinHandle<Result<(), ElectionError>> {
    let agent = Arc::clone(agent);
    tokio::spawn(async move { agent.run().await })
}

async fn wait_for_role(agent: &ElectionAgent, role: Role) {
    let mut roles = agent.subscribe_role();
    roles
        .wait_for(|current| *current == role)
        .await
        .expect("agent dropped its role channel");
}

fn recording_watch() -> (WatchCallback, mpsc::UnboundedReceiver<WatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: WatchCallback = Arc::new(move |event: WatchEvent| {
        let _ = tx.send(event);
    });
    (callback, rx)
}

async fn next_delete(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
    loop {
        let event = rx.recv().await.expect("watch stream closed");
        if event.is_delete() {
            return event;
        }
    }
}

/// Grants a lease and writes the leader key as `holder`, bypassing any agent.
async fn seed_leader(service: &MockCoordinationService, holder: &str) -> Lease {
    let lease = service.create_lease(Duration::from_secs(2)).await.unwrap();
    assert!(service.put_if_absent(KEY, holder, &lease).await.unwrap());
    lease
}

// ============================================================================
// Mutual Exclusion
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_agents_elect_exactly_one_leader() {
    let service = MockCoordinationService::new();
    let mut join_set = JoinSet::new();

    for i in 0..10 {
        let agent = agent(ElectionConfig::new(format!("server-{}", i)), &service);
        join_set.spawn(async move {
            let outcome = agent.attempt_election().await;
            (agent.instance_id().to_string(), outcome.won())
        });
    }

    let mut winners = HashSet::new();
    let mut losers = 0;
    while let Some(result) = join_set.join_next().await {
        let (instance_id, won) = result.unwrap();
        if won {
            winners.insert(instance_id);
        } else {
            losers += 1;
        }
    }

    assert_eq!(winners.len(), 1, "exactly one agent must win");
    assert_eq!(losers, 9);

    let winner = winners.into_iter().next().unwrap();
    assert_eq!(service.value_of(KEY).await, Some(winner));
    // Only the winner's lease survives; every loser discarded its own.
    assert_eq!(service.active_lease_count().await, 1);
}

#[tokio::test]
async fn test_attempt_against_populated_key_creates_nothing() {
    let service = MockCoordinationService::new();
    let agent = agent(ElectionConfig::new("server-a"), &service);

    assert!(agent.attempt_election().await.won());
    let original = service.get(KEY).await.unwrap().unwrap();

    for _ in 0..5 {
        assert!(!agent.attempt_election().await.won());
    }

    let current = service.get(KEY).await.unwrap().unwrap();
    assert_eq!(current, original);
    assert_eq!(service.active_lease_count().await, 1);
    assert_eq!(service.lease_grants(), 6);
}

// ============================================================================
// Lease Expiry and Notifications
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unrefreshed_lease_expires_and_notifies_watcher() {
    let service = MockCoordinationService::new();
    let _reaper = service.spawn_reaper(Duration::from_millis(50));

    let agent = agent(fast_config("server-a"), &service);
    assert!(agent.attempt_election().await.won());

    let (callback, mut events) = recording_watch();
    let _subscription = service.watch(KEY, callback).await.unwrap();

    let granted = Instant::now();
    let event = next_delete(&mut events).await;

    assert_eq!(event.key, KEY);
    assert!(granted.elapsed() >= Duration::from_secs(2));
    assert!(granted.elapsed() < Duration::from_millis(2100));
    assert!(service.value_of(KEY).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_graceful_exit_is_faster_than_ttl_expiry() {
    let service = MockCoordinationService::new();
    let _reaper = service.spawn_reaper(Duration::from_millis(50));
    let (callback, mut events) = recording_watch();
    let _subscription = service.watch(KEY, callback).await.unwrap();

    // Graceful: the leader steps down and revokes its lease.
    let graceful = agent(fast_config("server-a"), &service);
    let runner = spawn_run(&graceful);
    wait_for_role(&graceful, Role::Leading).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stopped_at = Instant::now();
    graceful.shutdown();
    next_delete(&mut events).await;
    let graceful_latency = stopped_at.elapsed();
    runner.await.unwrap().unwrap();

    // Abandoned: the leader wins and then never refreshes.
    let abandoned = agent(fast_config("server-b"), &service);
    assert!(abandoned.attempt_election().await.won());
    let abandoned_at = Instant::now();
    next_delete(&mut events).await;
    let expiry_latency = abandoned_at.elapsed();

    assert!(graceful_latency < Duration::from_millis(100));
    assert!(expiry_latency >= Duration::from_secs(2));
}

// ============================================================================
// Follower Behavior
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_notification_triggers_single_attempt() {
    let service = MockCoordinationService::new();
    let leader_lease = seed_leader(&service, "server-a").await;

    let follower = agent(fast_config("server-b"), &service);
    let runner = spawn_run(&follower);
    wait_for_role(&follower, Role::Following).await;

    let attempts_before = service.put_attempts();
    assert_eq!(follower.stats().await.attempts, 1);

    service.revoke_lease(&leader_lease).await.unwrap();
    wait_for_role(&follower, Role::Leading).await;

    assert_eq!(service.put_attempts(), attempts_before + 1);
    let stats = follower.stats().await;
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.follower_wakeups, 1);

    follower.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_follower_takes_over_after_leader_crash() {
    let service = MockCoordinationService::new();
    let _reaper = service.spawn_reaper(Duration::from_millis(50));

    // A wins and then goes silent, as if the process had died.
    let crashed = agent(fast_config("server-a"), &service);
    assert!(crashed.attempt_election().await.won());

    let follower = agent(fast_config("server-b"), &service);
    let runner = spawn_run(&follower);
    wait_for_role(&follower, Role::Following).await;

    let started = Instant::now();
    wait_for_role(&follower, Role::Leading).await;

    assert!(started.elapsed() <= Duration::from_millis(2100));
    assert_eq!(service.value_of(KEY).await.as_deref(), Some("server-b"));

    follower.shutdown();
    runner.await.unwrap().unwrap();
}

// ============================================================================
// Failover Scenario
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_leader_hands_over_after_voluntary_stop() {
    let service = MockCoordinationService::new();

    let a = agent(ElectionConfig::new("A"), &service);
    let a_runner = spawn_run(&a);
    wait_for_role(&a, Role::Leading).await;
    assert_eq!(service.value_of(KEY).await.as_deref(), Some("A"));

    let b = agent(ElectionConfig::new("B"), &service);
    let b_runner = spawn_run(&b);
    wait_for_role(&b, Role::Following).await;
    assert_eq!(b.stats().await.elections_lost, 1);

    // A leads for five seconds, refreshing every 500ms.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(a.stats().await.refreshes >= 10);
    assert_eq!(service.value_of(KEY).await.as_deref(), Some("A"));

    a.shutdown();
    tokio::time::timeout(Duration::from_secs(1), a_runner)
        .await
        .expect("A did not stop within 1s")
        .unwrap()
        .unwrap();
    assert_ne!(service.value_of(KEY).await.as_deref(), Some("A"));

    // B's watch fires within one poll interval and B wins the re-election.
    tokio::time::timeout(Duration::from_secs(1), wait_for_role(&b, Role::Leading))
        .await
        .expect("B did not take over within the poll interval");
    assert_eq!(service.value_of(KEY).await.as_deref(), Some("B"));

    b.shutdown();
    b_runner.await.unwrap().unwrap();
    assert!(service.value_of(KEY).await.is_none());
}

// ============================================================================
// Connectivity Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lease_creation_failure_falls_back_to_follower() {
    let service = MockCoordinationService::new();
    service.set_unavailable(true);
    let agent = agent(fast_config("server-a"), &service);

    let outcome = agent.attempt_election().await;
    match &outcome {
        ElectionOutcome::Lost(FollowReason::Unreachable { error }) => {
            assert!(error.is_connectivity());
        }
        other => panic!("expected unreachable, got {:?}", other),
    }

    let next = agent.step(ElectionState::Attempting).await;
    assert!(matches!(
        next,
        ElectionState::Following(FollowReason::Unreachable { .. })
    ));

    // Once the store is back the running agent recovers on its own.
    let runner = spawn_run(&agent);
    wait_for_role(&agent, Role::Following).await;
    service.set_unavailable(false);
    wait_for_role(&agent, Role::Leading).await;

    assert!(agent.stats().await.connectivity_fallbacks >= 2);
    agent.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stalled_store_is_bounded_by_request_timeout() {
    let service = MockCoordinationService::new();
    service.set_latency(Duration::from_secs(30));
    let agent = agent(fast_config("server-a"), &service);

    let started = Instant::now();
    let next = agent.step(ElectionState::Attempting).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    match next {
        ElectionState::Following(FollowReason::Unreachable { error }) => {
            assert!(error.to_string().contains("timed out"));
        }
        other => panic!("expected timeout fallback, got {:?}", other),
    }
}

// ============================================================================
// Graceful Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let service = MockCoordinationService::new();
    let agents: Vec<_> = (0..3)
        .map(|i| agent(fast_config(&format!("server-{}", i)), &service))
        .collect();
    let runners: Vec<_> = agents.iter().map(spawn_run).collect();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let leaders = agents
        .iter()
        .filter(|agent| agent.role() == Role::Leading)
        .count();
    assert_eq!(leaders, 1);
    assert_eq!(service.watcher_count(KEY).await, 2);

    for agent in &agents {
        agent.shutdown();
    }
    for runner in runners {
        runner.await.unwrap().unwrap();
    }

    for agent in &agents {
        assert_eq!(agent.role(), Role::Stopped);
    }
    assert!(service.value_of(KEY).await.is_none());
    assert_eq!(service.active_lease_count().await, 0);
    assert_eq!(service.watcher_count(KEY).await, 0);
}
