//! In-memory implementation of the CoordinationClient trait.
//!
//! `MockCoordinationService` behaves like a single-node coordination store:
//! leases expire on a TTL, keys bound to a lease vanish with it, the
//! create-if-absent transaction is atomic, and watchers receive `Delete`
//! events when that happens. It is used by the unit and integration tests
//! and by the `memory` backend of the CLI.
//!
//! Time is measured with `tokio::time::Instant`, so tests running on a paused
//! clock can drive lease expiry with `tokio::time::advance`.
//!
//! # Failure injection
//!
//! - [`set_unavailable`](MockCoordinationService::set_unavailable) makes every
//!   call fail with [`CoordinationError::Unavailable`]
//! - [`set_latency`](MockCoordinationService::set_latency) delays every call,
//!   which is how request timeouts are exercised

use super::{
    CoordinationClient, CoordinationError, KeyValue, Lease, LeaseId, WatchCallback, WatchEvent,
    WatchId, WatchSubscription,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Buffered watch events per key before slow watchers start lagging.
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// A stored key.
#[derive(Debug, Clone)]
struct StoredKey {
    value: String,
    version: i64,
    lease: Option<LeaseId>,
}

/// A granted lease.
#[derive(Debug, Clone)]
struct LeaseRecord {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

/// Everything guarded by the store lock.
#[derive(Debug, Default)]
struct StoreState {
    keys: HashMap<String, StoredKey>,
    leases: HashMap<LeaseId, LeaseRecord>,
    watchers: HashMap<String, broadcast::Sender<WatchEvent>>,
    active_watches: HashMap<WatchId, String>,
    revision: i64,
    next_lease_id: i64,
}

impl StoreState {
    /// Deletes a key and notifies its watchers. Returns `false` if absent.
    fn delete_key(&mut self, key: &str) -> bool {
        let Some(stored) = self.keys.remove(key) else {
            return false;
        };

        if let Some(lease_id) = stored.lease {
            if let Some(record) = self.leases.get_mut(&lease_id) {
                record.keys.remove(key);
            }
        }

        self.revision += 1;
        self.notify(WatchEvent::delete(key, self.revision));
        true
    }

    /// Drops a lease and every key attached to it.
    fn drop_lease(&mut self, lease_id: LeaseId) -> bool {
        let Some(record) = self.leases.remove(&lease_id) else {
            return false;
        };

        for key in record.keys {
            let bound_here = self
                .keys
                .get(&key)
                .map(|stored| stored.lease == Some(lease_id))
                .unwrap_or(false);
            if bound_here {
                self.delete_key(&key);
            }
        }
        true
    }

    /// Expires every lease whose deadline has passed.
    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, record)| record.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            debug!(lease_id = %lease_id, "Lease expired");
            self.drop_lease(lease_id);
        }
    }

    fn notify(&self, event: WatchEvent) {
        if let Some(sender) = self.watchers.get(&event.key) {
            // No receivers is fine; nobody is watching right now.
            let _ = sender.send(event);
        }
    }
}

/// An in-memory coordination service.
///
/// Clones share the same store, so several election agents can contend
/// through clones of one instance exactly as separate processes would
/// through one etcd cluster.
///
/// # Example
///
/// ```rust
/// use le_core::coordination::{CoordinationClient, MockCoordinationService};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let service = MockCoordinationService::new();
/// let peer = service.clone();
///
/// let lease_a = service.create_lease(Duration::from_secs(10)).await?;
/// let lease_b = peer.create_lease(Duration::from_secs(10)).await?;
///
/// assert!(service.put_if_absent("/key/leader", "a", &lease_a).await?);
/// assert!(!peer.put_if_absent("/key/leader", "b", &lease_b).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MockCoordinationService {
    state: Arc<RwLock<StoreState>>,
    next_watch_id: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    lease_grants: Arc<AtomicU64>,
    put_attempts: Arc<AtomicU64>,
}

impl MockCoordinationService {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState {
                next_lease_id: 1,
                ..Default::default()
            })),
            next_watch_id: Arc::new(AtomicU64::new(1)),
            unavailable: Arc::new(AtomicBool::new(false)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            lease_grants: Arc::new(AtomicU64::new(0)),
            put_attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Makes every subsequent call fail with `Unavailable` (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Spawns a background task that expires lapsed leases every `interval`.
    ///
    /// Without it, expiry happens lazily on the next call into the store,
    /// which means an idle watcher would never hear about a dead leader.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                state.write().await.reap_expired(Instant::now());
            }
        })
    }

    /// Returns the current value of `key`, if present.
    pub async fn value_of(&self, key: &str) -> Option<String> {
        let mut state = self.state.write().await;
        state.reap_expired(Instant::now());
        state.keys.get(key).map(|stored| stored.value.clone())
    }

    /// Returns the number of leases that are still alive.
    pub async fn active_lease_count(&self) -> usize {
        let mut state = self.state.write().await;
        state.reap_expired(Instant::now());
        state.leases.len()
    }

    /// Returns how many leases have been granted in total.
    pub fn lease_grants(&self) -> u64 {
        self.lease_grants.load(Ordering::SeqCst)
    }

    /// Returns how many create-if-absent transactions have been attempted.
    pub fn put_attempts(&self) -> u64 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of live watch registrations on `key`.
    pub async fn watcher_count(&self, key: &str) -> usize {
        let state = self.state.read().await;
        state.active_watches.values().filter(|k| *k == key).count()
    }

    /// Deletes `key` directly, as an operator would.
    pub async fn delete_key(&self, key: &str) -> bool {
        self.state.write().await.delete_key(key)
    }

    /// Expires a lease immediately, as if its TTL had run out.
    pub async fn expire_lease(&self, lease_id: LeaseId) -> bool {
        self.state.write().await.drop_lease(lease_id)
    }

    /// Applies injected latency and unavailability to a call.
    async fn enter(&self, operation: &str) -> Result<(), CoordinationError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            trace!(operation = operation, "Rejecting call, store unavailable");
            return Err(CoordinationError::unavailable(format!(
                "{} failed: connection refused",
                operation
            )));
        }
        Ok(())
    }
}

impl Default for MockCoordinationService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockCoordinationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCoordinationService")
            .field("unavailable", &self.unavailable)
            .field("lease_grants", &self.lease_grants)
            .field("put_attempts", &self.put_attempts)
            .finish()
    }
}

#[async_trait]
impl CoordinationClient for MockCoordinationService {
    async fn create_lease(&self, ttl: Duration) -> Result<Lease, CoordinationError> {
        self.enter("create_lease").await?;
        self.lease_grants.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write().await;
        let now = Instant::now();
        state.reap_expired(now);

        let lease_id = LeaseId::new(state.next_lease_id);
        state.next_lease_id += 1;
        state.leases.insert(
            lease_id,
            LeaseRecord {
                ttl,
                expires_at: now + ttl,
                keys: HashSet::new(),
            },
        );

        trace!(lease_id = %lease_id, ttl_ms = ttl.as_millis() as u64, "Granted lease");
        Ok(Lease::new(lease_id, ttl))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: &Lease,
    ) -> Result<bool, CoordinationError> {
        self.enter("put_if_absent").await?;
        self.put_attempts.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write().await;
        state.reap_expired(Instant::now());

        if !state.leases.contains_key(&lease.id) {
            return Err(CoordinationError::lease_expired(lease.id));
        }

        // Compare: version(key) == 0
        if state.keys.contains_key(key) {
            return Ok(false);
        }

        state.revision += 1;
        let revision = state.revision;
        state.keys.insert(
            key.to_string(),
            StoredKey {
                value: value.to_string(),
                version: 1,
                lease: Some(lease.id),
            },
        );
        if let Some(record) = state.leases.get_mut(&lease.id) {
            record.keys.insert(key.to_string());
        }
        state.notify(WatchEvent::put(key, value, revision));

        Ok(true)
    }

    async fn refresh_lease(&self, lease: &Lease) -> Result<(), CoordinationError> {
        self.enter("refresh_lease").await?;

        let mut state = self.state.write().await;
        let now = Instant::now();
        state.reap_expired(now);

        match state.leases.get_mut(&lease.id) {
            Some(record) => {
                record.expires_at = now + record.ttl;
                Ok(())
            }
            None => Err(CoordinationError::lease_expired(lease.id)),
        }
    }

    async fn revoke_lease(&self, lease: &Lease) -> Result<(), CoordinationError> {
        self.enter("revoke_lease").await?;

        let mut state = self.state.write().await;
        state.reap_expired(Instant::now());
        if state.drop_lease(lease.id) {
            debug!(lease_id = %lease.id, "Lease revoked");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, CoordinationError> {
        self.enter("get").await?;

        let mut state = self.state.write().await;
        state.reap_expired(Instant::now());
        Ok(state.keys.get(key).map(|stored| KeyValue {
            key: key.to_string(),
            value: stored.value.clone(),
            version: stored.version,
            lease: stored.lease,
        }))
    }

    async fn watch(
        &self,
        key: &str,
        callback: WatchCallback,
    ) -> Result<WatchSubscription, CoordinationError> {
        self.enter("watch").await?;

        let watch_id = WatchId::new(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        let mut receiver = {
            let mut state = self.state.write().await;
            state.active_watches.insert(watch_id, key.to_string());
            state
                .watchers
                .entry(key.to_string())
                .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let watched_key = key.to_string();
        let delivery = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            key = %watched_key,
                            watch_id = %watch_id,
                            skipped = skipped,
                            "Watcher lagged, events dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!(key = key, watch_id = %watch_id, "Watch registered");
        Ok(WatchSubscription::new(watch_id, key, delivery))
    }

    async fn cancel_watch(
        &self,
        mut subscription: WatchSubscription,
    ) -> Result<(), CoordinationError> {
        // Delivery stops and the registration goes away even if the
        // cancel request itself fails.
        subscription.stop_delivery();
        self.state
            .write()
            .await
            .active_watches
            .remove(&subscription.id());

        self.enter("cancel_watch").await?;
        debug!(key = subscription.key(), watch_id = %subscription.id(), "Watch cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::task::JoinSet;

    const KEY: &str = "/key/leader";

    fn recording_callback() -> (WatchCallback, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: WatchCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn test_put_if_absent_creates_key() {
        let service = MockCoordinationService::new();
        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();

        assert!(service.put_if_absent(KEY, "a", &lease).await.unwrap());

        let kv = service.get(KEY).await.unwrap().unwrap();
        assert_eq!(kv.value, "a");
        assert_eq!(kv.version, 1);
        assert_eq!(kv.lease, Some(lease.id));
    }

    #[tokio::test]
    async fn test_put_if_absent_rejects_existing_key() {
        let service = MockCoordinationService::new();
        let lease_a = service.create_lease(Duration::from_secs(10)).await.unwrap();
        let lease_b = service.create_lease(Duration::from_secs(10)).await.unwrap();

        assert!(service.put_if_absent(KEY, "a", &lease_a).await.unwrap());
        assert!(!service.put_if_absent(KEY, "b", &lease_b).await.unwrap());
        assert_eq!(service.value_of(KEY).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_put_with_dead_lease_fails() {
        let service = MockCoordinationService::new();
        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();
        service.revoke_lease(&lease).await.unwrap();

        let err = service.put_if_absent(KEY, "a", &lease).await.unwrap_err();
        assert!(err.is_lease_expired());
    }

    #[tokio::test]
    async fn test_concurrent_put_if_absent_single_winner() {
        let service = MockCoordinationService::new();
        let mut tasks = JoinSet::new();

        for i in 0..10 {
            let peer = service.clone();
            tasks.spawn(async move {
                let lease = peer.create_lease(Duration::from_secs(10)).await?;
                peer.put_if_absent(KEY, &format!("server-{}", i), &lease)
                    .await
            });
        }

        let mut winners = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap().unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_revoke_deletes_key_and_notifies() {
        let service = MockCoordinationService::new();
        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();
        service.put_if_absent(KEY, "a", &lease).await.unwrap();

        let (callback, mut events) = recording_callback();
        let _subscription = service.watch(KEY, callback).await.unwrap();

        service.revoke_lease(&lease).await.unwrap();

        assert!(service.value_of(KEY).await.is_none());
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_delete());
        assert_eq!(event.key, KEY);
    }

    #[tokio::test]
    async fn test_revoke_unknown_lease_is_ok() {
        let service = MockCoordinationService::new();
        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();
        service.revoke_lease(&lease).await.unwrap();
        service.revoke_lease(&lease).await.unwrap();
        assert_eq!(service.active_lease_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_key_via_reaper() {
        let service = MockCoordinationService::new();
        let reaper = service.spawn_reaper(Duration::from_millis(100));

        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();
        service.put_if_absent(KEY, "a", &lease).await.unwrap();

        let (callback, mut events) = recording_callback();
        let _subscription = service.watch(KEY, callback).await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        let event = tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_delete());
        assert!(service.value_of(KEY).await.is_none());
        assert_eq!(service.active_lease_count().await, 0);

        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_lease() {
        let service = MockCoordinationService::new();
        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();
        service.put_if_absent(KEY, "a", &lease).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            service.refresh_lease(&lease).await.unwrap();
        }

        assert_eq!(service.value_of(KEY).await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_expiry_fails() {
        let service = MockCoordinationService::new();
        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;

        let err = service.refresh_lease(&lease).await.unwrap_err();
        assert!(err.is_lease_expired());
    }

    #[tokio::test]
    async fn test_version_resets_after_delete() {
        let service = MockCoordinationService::new();
        let lease_a = service.create_lease(Duration::from_secs(10)).await.unwrap();
        service.put_if_absent(KEY, "a", &lease_a).await.unwrap();
        assert!(service.delete_key(KEY).await);

        let lease_b = service.create_lease(Duration::from_secs(10)).await.unwrap();
        assert!(service.put_if_absent(KEY, "b", &lease_b).await.unwrap());
        assert_eq!(service.get(KEY).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_calls() {
        let service = MockCoordinationService::new();
        service.set_unavailable(true);

        let err = service
            .create_lease(Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        assert!(service.get(KEY).await.is_err());

        service.set_unavailable(false);
        assert!(service.create_lease(Duration::from_secs(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_watch_stops_delivery() {
        let service = MockCoordinationService::new();
        let (callback, mut events) = recording_callback();
        let subscription = service.watch(KEY, callback).await.unwrap();
        assert_eq!(service.watcher_count(KEY).await, 1);

        service.cancel_watch(subscription).await.unwrap();
        assert_eq!(service.watcher_count(KEY).await, 0);

        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();
        service.put_if_absent(KEY, "a", &lease).await.unwrap();
        service.revoke_lease(&lease).await.unwrap();

        // The callback (and its sender) went away with the delivery task.
        let next = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(matches!(next, Ok(None)));
    }

    #[tokio::test]
    async fn test_failed_cancel_still_drops_registration() {
        let service = MockCoordinationService::new();
        let (callback, _events) = recording_callback();
        let subscription = service.watch(KEY, callback).await.unwrap();

        service.set_unavailable(true);
        let err = service.cancel_watch(subscription).await.unwrap_err();

        assert!(err.is_connectivity());
        assert_eq!(service.watcher_count(KEY).await, 0);
    }

    #[tokio::test]
    async fn test_expire_lease_helper() {
        let service = MockCoordinationService::new();
        let lease = service.create_lease(Duration::from_secs(10)).await.unwrap();
        service.put_if_absent(KEY, "a", &lease).await.unwrap();

        assert!(service.expire_lease(lease.id).await);
        assert!(service.value_of(KEY).await.is_none());
        assert!(service.refresh_lease(&lease).await.is_err());
    }
}
