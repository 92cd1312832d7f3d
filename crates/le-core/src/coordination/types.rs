//! Types shared by coordination backends.
//!
//! - `Lease`: a time-bounded liveness handle granted by the service
//! - `KeyValue`: a read view of a stored key
//! - `WatchEvent`: a change notification for a watched key
//! - `WatchSubscription`: a live watch registration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Opaque identity of a lease inside the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(i64);

impl LeaseId {
    /// Wraps a raw lease id.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw lease id.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A lease granted by the coordination service.
///
/// Any key written with a lease attached is deleted by the service when the
/// lease expires (TTL elapsed without a refresh) or is revoked. The lease is
/// a plain handle; refresh and revoke go through the
/// [`CoordinationClient`](super::CoordinationClient) that granted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Identity of the lease.
    pub id: LeaseId,

    /// Time-to-live granted by the service.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// When the lease was granted.
    pub granted_at: DateTime<Utc>,
}

impl Lease {
    /// Creates a lease handle granted now.
    pub fn new(id: LeaseId, ttl: Duration) -> Self {
        Self {
            id,
            ttl,
            granted_at: Utc::now(),
        }
    }
}

/// A key as currently stored in the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    pub key: String,

    /// The stored value.
    pub value: String,

    /// Number of writes since the key was (re)created. Starts at 1.
    pub version: i64,

    /// The lease attached to the key, if any.
    pub lease: Option<LeaseId>,
}

/// Kind of change observed on a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    /// The key was created or overwritten.
    Put,
    /// The key was deleted (explicitly, by revocation, or by lease expiry).
    Delete,
}

/// A change notification for a watched key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// The key that changed.
    pub key: String,

    /// What happened to it.
    pub kind: WatchEventKind,

    /// The new value for `Put` events.
    pub value: Option<String>,

    /// Store revision at which the change happened.
    pub revision: i64,
}

impl WatchEvent {
    /// Creates a `Put` event.
    pub fn put(key: impl Into<String>, value: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            kind: WatchEventKind::Put,
            value: Some(value.into()),
            revision,
        }
    }

    /// Creates a `Delete` event.
    pub fn delete(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            kind: WatchEventKind::Delete,
            value: None,
            revision,
        }
    }

    /// Returns `true` for delete notifications.
    pub fn is_delete(&self) -> bool {
        self.kind == WatchEventKind::Delete
    }
}

/// Callback invoked for each watch event.
///
/// Runs on the backend's delivery task, which may be shared. Implementations
/// must only signal and return; no blocking and no long-running work.
pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Identity of a watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchId(u64);

impl WatchId {
    /// Wraps a raw watch id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw watch id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// A live watch registration.
///
/// Hand it back to [`CoordinationClient::cancel_watch`](super::CoordinationClient::cancel_watch)
/// to tear it down. If a subscription is dropped without being cancelled the
/// delivery task is aborted so the callback stops firing, but the backend may
/// keep server-side state until its own cleanup runs.
pub struct WatchSubscription {
    id: WatchId,
    key: String,
    delivery: Option<JoinHandle<()>>,
}

impl WatchSubscription {
    /// Creates a subscription backed by the given delivery task.
    pub fn new(id: WatchId, key: impl Into<String>, delivery: JoinHandle<()>) -> Self {
        Self {
            id,
            key: key.into(),
            delivery: Some(delivery),
        }
    }

    /// Returns the watch id.
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Returns the watched key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `true` while the delivery task is still running.
    pub fn is_active(&self) -> bool {
        self.delivery
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stops delivering events to the callback.
    pub fn stop_delivery(&mut self) {
        if let Some(handle) = self.delivery.take() {
            handle.abort();
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.stop_delivery();
    }
}

impl fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSubscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}
