//! etcd v3 implementation of the CoordinationClient trait.
//!
//! # How it works
//!
//! - Leases map to etcd leases (`LeaseGrant`, `LeaseKeepAlive`, `LeaseRevoke`)
//! - Create-if-absent is a single `Txn` comparing `version(key) == 0` and
//!   putting the key with the lease attached on success
//! - Watches use the etcd watch stream; a delivery task translates etcd
//!   events into [`WatchEvent`]s and hands them to the callback
//!
//! # Example
//!
//! ```rust,ignore
//! use le_core::coordination::{CoordinationClient, EtcdCoordinationClient};
//! use std::time::Duration;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client =
//!         EtcdCoordinationClient::connect(&["localhost:2379"], Duration::from_secs(3)).await?;
//!     let lease = client.create_lease(Duration::from_secs(10)).await?;
//!     let won = client.put_if_absent("/key/leader", "server-a", &lease).await?;
//!     println!("won: {}", won);
//!     Ok(())
//! }
//! ```

use super::{
    CoordinationClient, CoordinationError, KeyValue, Lease, LeaseId, WatchCallback, WatchEvent,
    WatchEventKind, WatchId, WatchSubscription,
};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, Txn, TxnOp, Watcher,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// An open keep-alive stream for one held lease.
struct KeepAlive {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

/// etcd-backed coordination client.
///
/// `etcd_client::Client` is cheap to clone (it shares one gRPC channel), so
/// every call works on its own clone and the struct itself stays `&self`.
/// Each refreshed lease keeps one keep-alive stream open until it is revoked
/// or a refresh fails.
pub struct EtcdCoordinationClient {
    client: Client,
    endpoints: Vec<String>,
    keep_alives: Arc<Mutex<HashMap<LeaseId, KeepAlive>>>,
    watchers: Arc<Mutex<HashMap<WatchId, Watcher>>>,
    next_watch_id: AtomicU64,
}

impl EtcdCoordinationClient {
    /// Connects to an etcd cluster.
    ///
    /// # Arguments
    ///
    /// * `endpoints` - etcd endpoints, e.g. `["localhost:2379"]`
    /// * `request_timeout` - per-request timeout applied by the gRPC channel
    pub async fn connect<S: AsRef<str>>(
        endpoints: &[S],
        request_timeout: Duration,
    ) -> Result<Self, CoordinationError> {
        let endpoints: Vec<String> = endpoints.iter().map(|e| e.as_ref().to_string()).collect();
        let options = ConnectOptions::new()
            .with_timeout(request_timeout)
            .with_connect_timeout(request_timeout);

        let client = Client::connect(endpoints.clone(), Some(options))
            .await
            .map_err(convert_etcd_error)?;

        debug!(endpoints = ?endpoints, "Connected to etcd");

        Ok(Self {
            client,
            endpoints,
            keep_alives: Arc::new(Mutex::new(HashMap::new())),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            next_watch_id: AtomicU64::new(1),
        })
    }

    /// Returns the configured endpoints.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

impl std::fmt::Debug for EtcdCoordinationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCoordinationClient")
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// Convert etcd client errors to CoordinationError.
fn convert_etcd_error(err: etcd_client::Error) -> CoordinationError {
    let message = err.to_string();
    match err {
        etcd_client::Error::InvalidArgs(_) => CoordinationError::unknown(message),
        etcd_client::Error::WatchError(_) => CoordinationError::unknown(message),
        _ => CoordinationError::unavailable(message),
    }
}

/// Convert etcd errors for calls made on behalf of a specific lease.
fn convert_lease_error(err: etcd_client::Error, lease_id: LeaseId) -> CoordinationError {
    if err.to_string().contains("lease not found") {
        CoordinationError::lease_expired(lease_id)
    } else {
        convert_etcd_error(err)
    }
}

/// Whole seconds for an etcd TTL, rounding sub-second remainders up.
fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

/// Sends one keep-alive on an open stream and waits for its answer.
async fn keep_alive_once(open: &mut KeepAlive, lease_id: LeaseId) -> Result<(), CoordinationError> {
    open.keeper
        .keep_alive()
        .await
        .map_err(|e| convert_lease_error(e, lease_id))?;
    read_keep_alive(open, lease_id).await
}

async fn read_keep_alive(open: &mut KeepAlive, lease_id: LeaseId) -> Result<(), CoordinationError> {
    let response = open
        .stream
        .message()
        .await
        .map_err(|e| convert_lease_error(e, lease_id))?;
    keep_alive_outcome(response.map(|r| r.ttl()), lease_id)
}

/// Maps the TTL in a keep-alive answer (or a closed stream) to a refresh result.
fn keep_alive_outcome(ttl: Option<i64>, lease_id: LeaseId) -> Result<(), CoordinationError> {
    match ttl {
        // etcd answers a keep-alive for a dead lease with TTL 0.
        Some(ttl) if ttl > 0 => Ok(()),
        Some(_) => Err(CoordinationError::lease_expired(lease_id)),
        None => Err(CoordinationError::unavailable(
            "lease keep-alive stream closed",
        )),
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordinationClient {
    async fn create_lease(&self, ttl: Duration) -> Result<Lease, CoordinationError> {
        let mut client = self.client.clone();
        let response = client
            .lease_grant(ttl_seconds(ttl), None)
            .await
            .map_err(convert_etcd_error)?;

        let granted = Duration::from_secs(response.ttl().max(0) as u64);
        Ok(Lease::new(LeaseId::new(response.id()), granted))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: &Lease,
    ) -> Result<bool, CoordinationError> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease.id.as_i64())),
            )]);

        let response = client
            .txn(txn)
            .await
            .map_err(|e| convert_lease_error(e, lease.id))?;
        Ok(response.succeeded())
    }

    async fn refresh_lease(&self, lease: &Lease) -> Result<(), CoordinationError> {
        let mut keep_alives = self.keep_alives.lock().await;

        let result = match keep_alives.get_mut(&lease.id) {
            Some(open) => keep_alive_once(open, lease.id).await,
            None => {
                // Opening the stream already sends the first keep-alive.
                let mut client = self.client.clone();
                let (keeper, stream) = client
                    .lease_keep_alive(lease.id.as_i64())
                    .await
                    .map_err(|e| convert_lease_error(e, lease.id))?;
                let mut open = KeepAlive { keeper, stream };
                let result = read_keep_alive(&mut open, lease.id).await;
                if result.is_ok() {
                    keep_alives.insert(lease.id, open);
                }
                return result;
            }
        };

        if result.is_err() {
            keep_alives.remove(&lease.id);
        }
        result
    }

    async fn revoke_lease(&self, lease: &Lease) -> Result<(), CoordinationError> {
        self.keep_alives.lock().await.remove(&lease.id);

        let mut client = self.client.clone();
        match client.lease_revoke(lease.id.as_i64()).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("lease not found") => Ok(()),
            Err(e) => Err(convert_etcd_error(e)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, CoordinationError> {
        let mut client = self.client.clone();
        let response = client.get(key, None).await.map_err(convert_etcd_error)?;

        let Some(kv) = response.kvs().first() else {
            return Ok(None);
        };

        Ok(Some(KeyValue {
            key: key.to_string(),
            value: String::from_utf8_lossy(kv.value()).into_owned(),
            version: kv.version(),
            lease: (kv.lease() != 0).then(|| LeaseId::new(kv.lease())),
        }))
    }

    async fn watch(
        &self,
        key: &str,
        callback: WatchCallback,
    ) -> Result<WatchSubscription, CoordinationError> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client.watch(key, None).await.map_err(convert_etcd_error)?;

        let watch_id = WatchId::new(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        self.watchers.lock().await.insert(watch_id, watcher);

        let watched_key = key.to_string();
        let delivery = tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        let revision = response.header().map(|h| h.revision()).unwrap_or(0);
                        for event in response.events() {
                            let kind = match event.event_type() {
                                EventType::Put => WatchEventKind::Put,
                                EventType::Delete => WatchEventKind::Delete,
                            };
                            let value = event
                                .kv()
                                .filter(|_| kind == WatchEventKind::Put)
                                .map(|kv| String::from_utf8_lossy(kv.value()).into_owned());
                            callback(WatchEvent {
                                key: watched_key.clone(),
                                kind,
                                value,
                                revision,
                            });
                        }
                        if response.canceled() {
                            debug!(
                                key = %watched_key,
                                watch_id = %watch_id,
                                error = %CoordinationError::watch_closed(watched_key.as_str()),
                                "Watch canceled by server"
                            );
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(
                            key = %watched_key,
                            watch_id = %watch_id,
                            error = %CoordinationError::watch_closed(watched_key.as_str()),
                            cause = %e,
                            "Watch stream failed"
                        );
                        break;
                    }
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
        subscription.stop_delivery();

        let watcher = self.watchers.lock().await.remove(&subscription.id());
        match watcher {
            Some(mut watcher) => watcher.cancel().await.map_err(convert_etcd_error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_seconds_rounds_up() {
        assert_eq!(ttl_seconds(Duration::from_secs(10)), 10);
        assert_eq!(ttl_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ttl_seconds(Duration::ZERO), 1);
    }

    #[test]
    fn test_keep_alive_outcome() {
        let id = LeaseId::new(7);
        assert!(keep_alive_outcome(Some(10), id).is_ok());
        assert!(keep_alive_outcome(Some(0), id).unwrap_err().is_lease_expired());
        assert!(keep_alive_outcome(None, id).unwrap_err().is_connectivity());
    }

    #[test]
    fn test_lease_not_found_maps_to_expired() {
        let err = etcd_client::Error::LeaseKeepAliveError("requested lease not found".into());
        let converted = convert_lease_error(err, LeaseId::new(9));
        assert!(converted.is_lease_expired());
    }

    #[test]
    fn test_transport_errors_are_connectivity() {
        let err = etcd_client::Error::LeaseKeepAliveError("stream reset".into());
        assert!(convert_etcd_error(err).is_connectivity());
    }
}
