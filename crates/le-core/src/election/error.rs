//! Error types for the election agent.
//!
//! Almost every error here is converted into a state transition by the agent
//! rather than returned to a caller. Only [`ElectionError::InvalidConfig`]
//! escapes [`ElectionAgent::run`](super::ElectionAgent::run).

use thiserror::Error;

use crate::coordination::{CoordinationError, LeaseId};

/// Errors that can occur during an election cycle.
#[derive(Error, Debug, Clone)]
pub enum ElectionError {
    /// The coordination service was unreachable or a request timed out.
    #[error("Connectivity error: {message}")]
    Connectivity {
        /// Description of the connectivity failure.
        message: String,
    },

    /// The leader key is already held. Expected contention, not a fault.
    #[error("Election for '{key}' lost{}", holder_suffix(.holder))]
    ElectionLost {
        /// The contested leader key.
        key: String,
        /// The current holder, when known.
        holder: Option<String>,
    },

    /// The lease TTL lapsed before a refresh landed.
    #[error("Lease {lease_id} expired")]
    LeaseExpired {
        /// The lease that expired.
        lease_id: LeaseId,
    },

    /// A watch could not be torn down cleanly. Never fatal.
    #[error("Watch teardown failed: {message}")]
    WatchTeardown {
        /// Description of the teardown failure.
        message: String,
    },

    /// The leader work hook failed.
    #[error("Leader work failed: {message}")]
    LeaderWork {
        /// Description of the failure.
        message: String,
    },

    /// The agent configuration is unusable.
    #[error("Invalid election configuration: {message}")]
    InvalidConfig {
        /// What is wrong with it.
        message: String,
    },
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_ref()
        .map(|h| format!(" to '{}'", h))
        .unwrap_or_default()
}

impl ElectionError {
    /// Creates a `Connectivity` error.
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
        }
    }

    /// Creates an `ElectionLost` error.
    pub fn election_lost(key: impl Into<String>, holder: Option<String>) -> Self {
        Self::ElectionLost {
            key: key.into(),
            holder,
        }
    }

    /// Creates a `LeaseExpired` error.
    pub fn lease_expired(lease_id: LeaseId) -> Self {
        Self::LeaseExpired { lease_id }
    }

    /// Creates a `WatchTeardown` error.
    pub fn watch_teardown(message: impl Into<String>) -> Self {
        Self::WatchTeardown {
            message: message.into(),
        }
    }

    /// Creates a `LeaderWork` error.
    pub fn leader_work(message: impl Into<String>) -> Self {
        Self::LeaderWork {
            message: message.into(),
        }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a connectivity error.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Returns `true` if this error indicates a lost election.
    pub fn is_election_lost(&self) -> bool {
        matches!(self, Self::ElectionLost { .. })
    }

    /// Returns `true` if this error indicates the lease has expired.
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, Self::LeaseExpired { .. })
    }

    /// Returns `true` for errors that must stop the agent.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// Short tag used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "connectivity",
            Self::ElectionLost { .. } => "election_lost",
            Self::LeaseExpired { .. } => "lease_expired",
            Self::WatchTeardown { .. } => "watch_teardown",
            Self::LeaderWork { .. } => "leader_work",
            Self::InvalidConfig { .. } => "invalid_config",
        }
    }
}

impl From<CoordinationError> for ElectionError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::LeaseExpired { lease_id } => Self::LeaseExpired { lease_id },
            CoordinationError::WatchClosed { .. } => Self::watch_teardown(err.to_string()),
            CoordinationError::Unavailable { .. }
            | CoordinationError::Timeout { .. }
            | CoordinationError::Unknown { .. } => Self::connectivity(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_election_lost_display() {
        let err = ElectionError::election_lost("/key/leader", Some("server-a".to_string()));
        assert!(err.is_election_lost());
        assert_eq!(err.to_string(), "Election for '/key/leader' lost to 'server-a'");

        let err = ElectionError::election_lost("/key/leader", None);
        assert_eq!(err.to_string(), "Election for '/key/leader' lost");
    }

    #[test]
    fn test_from_coordination_errors() {
        let err: ElectionError = CoordinationError::unavailable("refused").into();
        assert!(err.is_connectivity());

        let err: ElectionError =
            CoordinationError::timeout("refresh_lease", Duration::from_secs(3)).into();
        assert!(err.is_connectivity());
        assert!(err.to_string().contains("refresh_lease"));

        let err: ElectionError = CoordinationError::lease_expired(LeaseId::new(5)).into();
        assert!(err.is_lease_expired());

        let err: ElectionError = CoordinationError::watch_closed("/key/leader").into();
        assert_eq!(err.kind(), "watch_teardown");
    }

    #[test]
    fn test_only_invalid_config_is_fatal() {
        assert!(ElectionError::invalid_config("empty key").is_fatal());
        assert!(!ElectionError::connectivity("refused").is_fatal());
        assert!(!ElectionError::lease_expired(LeaseId::new(1)).is_fatal());
        assert!(!ElectionError::watch_teardown("closed").is_fatal());
        assert!(!ElectionError::leader_work("boom").is_fatal());
    }
}
