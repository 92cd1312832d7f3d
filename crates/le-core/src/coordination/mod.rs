//! Client abstraction over a strongly-consistent coordination service.
//!
//! Leader election needs only a handful of primitives from the service that
//! stores the leader key:
//!
//! 1. **Leases**: time-bounded liveness handles that can be refreshed and revoked
//! 2. **Atomic create-if-absent**: a transaction guarded by "this key has no version"
//! 3. **Lease-bound keys**: keys attached to a lease disappear when it expires or is revoked
//! 4. **Watches**: change notifications (in particular deletes) for a key
//!
//! The [`CoordinationClient`] trait captures exactly these, so the election
//! agent can run against etcd in production and against the in-memory
//! [`MockCoordinationService`] in tests.
//!
//! # Example
//!
//! ```rust
//! use le_core::coordination::{CoordinationClient, MockCoordinationService};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = MockCoordinationService::new();
//!
//! let lease = service.create_lease(Duration::from_secs(10)).await?;
//! if service.put_if_absent("/key/leader", "server-a", &lease).await? {
//!     println!("server-a holds the leader key");
//!     service.refresh_lease(&lease).await?;
//!     service.revoke_lease(&lease).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Implementations
//!
//! - [`MockCoordinationService`]: In-memory implementation for tests and local runs
//! - `EtcdCoordinationClient`: etcd v3 backend (requires the `etcd` feature)

mod error;
mod mock;
mod types;

#[cfg(feature = "etcd")]
mod etcd;

pub use error::CoordinationError;
pub use mock::MockCoordinationService;
pub use types::{
    KeyValue, Lease, LeaseId, WatchCallback, WatchEvent, WatchEventKind, WatchId,
    WatchSubscription,
};

#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinationClient;

use async_trait::async_trait;
use std::time::Duration;

/// Operations the election agent consumes from the coordination service.
///
/// Every method is a potentially blocking network call. Callers are expected
/// to bound them with a request timeout; implementations report connectivity
/// failures as [`CoordinationError::Unavailable`].
///
/// # Lease Lifecycle
///
/// ```text
///                create_lease()
///                      │
///                      ▼
///               ┌─────────────┐  refresh_lease()
///               │   Active    │◀──────────────┐
///               └─────────────┘───────────────┘
///                 │         │
///   TTL elapses   │         │  revoke_lease()
///                 ▼         ▼
///        ┌─────────────┐ ┌─────────────┐
///        │   Expired   │ │   Revoked   │
///        └─────────────┘ └─────────────┘
///                 │         │
///                 └────┬────┘
///                      ▼
///        attached keys deleted, watchers get Delete
/// ```
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Grants a new lease with the given TTL.
    ///
    /// TTLs are second-granular on real backends; sub-second remainders are
    /// rounded up.
    async fn create_lease(&self, ttl: Duration) -> Result<Lease, CoordinationError>;

    /// Atomically creates `key = value` bound to `lease`, only if `key` has no
    /// existing version.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The key was created and is now attached to the lease
    /// * `Ok(false)` - The key already exists (someone else holds it)
    /// * `Err(e)` - The transaction could not be committed
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: &Lease,
    ) -> Result<bool, CoordinationError>;

    /// Resets the TTL countdown of a lease.
    ///
    /// Fails with [`CoordinationError::LeaseExpired`] if the lease already
    /// lapsed or was revoked.
    async fn refresh_lease(&self, lease: &Lease) -> Result<(), CoordinationError>;

    /// Revokes a lease, deleting every key attached to it immediately.
    ///
    /// Revoking a lease that no longer exists succeeds.
    async fn revoke_lease(&self, lease: &Lease) -> Result<(), CoordinationError>;

    /// Reads the current value of a key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, CoordinationError>;

    /// Registers a watch on `key`.
    ///
    /// Every subsequent change to the key is passed to `callback` from a
    /// delivery task owned by the returned subscription.
    async fn watch(
        &self,
        key: &str,
        callback: WatchCallback,
    ) -> Result<WatchSubscription, CoordinationError>;

    /// Tears down a watch registration.
    async fn cancel_watch(&self, subscription: WatchSubscription)
        -> Result<(), CoordinationError>;
}
