//! Error types for coordination service operations.
//!
//! These are the failures a coordination backend can report back to the
//! election agent: the service being unreachable, a request timing out, a
//! lease that lapsed before it was refreshed, or a watch stream closing.

use std::time::Duration;

use thiserror::Error;

use super::types::LeaseId;

/// Errors that can occur while talking to the coordination service.
#[derive(Error, Debug, Clone)]
pub enum CoordinationError {
    /// The coordination service could not be reached.
    #[error("Coordination service unavailable: {message}")]
    Unavailable {
        /// Description of the connectivity failure.
        message: String,
    },

    /// A request did not complete within the configured timeout.
    #[error("Coordination request '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// The operation that stalled.
        operation: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The lease TTL lapsed (or the lease was revoked) before a refresh landed.
    #[error("Lease {lease_id} has expired")]
    LeaseExpired {
        /// The lease that expired.
        lease_id: LeaseId,
    },

    /// The watch stream for a key closed unexpectedly.
    #[error("Watch on key '{key}' closed")]
    WatchClosed {
        /// The watched key.
        key: String,
    },

    /// An unknown or internal error occurred.
    #[error("Unknown coordination error: {message}")]
    Unknown {
        /// Description of the error.
        message: String,
    },
}

impl CoordinationError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Creates a `LeaseExpired` error.
    pub fn lease_expired(lease_id: LeaseId) -> Self {
        Self::LeaseExpired { lease_id }
    }

    /// Creates a `WatchClosed` error.
    pub fn watch_closed(key: impl Into<String>) -> Self {
        Self::WatchClosed { key: key.into() }
    }

    /// Creates an `Unknown` error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Returns `true` if the service was unreachable or the request timed out.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Returns `true` if this error indicates the lease has expired.
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, Self::LeaseExpired { .. })
    }

    /// Returns `true` if this error indicates a closed watch.
    pub fn is_watch_closed(&self) -> bool {
        matches!(self, Self::WatchClosed { .. })
    }
}
