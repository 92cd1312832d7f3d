//! State machine types for the election agent.
//!
//! ```text
//!                 ┌──────────────┐
//!      ┌─────────▶│  Attempting  │◀────────────┐
//!      │          └──────────────┘             │
//!      │      CAS won │        │ CAS lost or   │
//!      │              │        │ unreachable   │
//!      │              ▼        ▼               │
//!  ┌─────────┐  lease lost  ┌───────────┐ key deleted
//!  │ Leading │  or stopped  │ Following │ or missing
//!  └─────────┘ ──(cooldown)─┴───────────┘ ─────┘
//! ```
//!
//! `Stopped` is only reachable through shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ElectionError;
use crate::coordination::Lease;

/// Why an election attempt fell back to following.
#[derive(Debug, Clone)]
pub enum FollowReason {
    /// The leader key is held by another process.
    Contended {
        /// The current holder, when it could be read.
        holder: Option<String>,
    },
    /// The attempt failed on a coordination error.
    Unreachable {
        /// The error that caused the fallback.
        error: ElectionError,
    },
}

impl FollowReason {
    /// Returns `true` if the attempt lost to another candidate.
    pub fn is_contended(&self) -> bool {
        matches!(self, Self::Contended { .. })
    }

    /// Returns the error describing this fallback for `key`.
    pub fn to_error(&self, key: &str) -> ElectionError {
        match self {
            Self::Contended { holder } => ElectionError::election_lost(key, holder.clone()),
            Self::Unreachable { error } => error.clone(),
        }
    }
}

impl fmt::Display for FollowReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contended { holder: Some(holder) } => write!(f, "held by '{}'", holder),
            Self::Contended { holder: None } => write!(f, "held by another process"),
            Self::Unreachable { error } => write!(f, "unreachable ({})", error),
        }
    }
}

/// Current state of an election agent, carrying the data each state owns.
#[derive(Debug, Clone)]
pub enum ElectionState {
    /// About to try the create-if-absent write.
    Attempting,
    /// Holding the leader key through the given lease.
    Leading(Lease),
    /// Waiting for the leader key to be vacated.
    Following(FollowReason),
    /// Shut down.
    Stopped,
}

impl ElectionState {
    /// Returns the payload-free role for this state.
    pub fn role(&self) -> Role {
        match self {
            Self::Attempting => Role::Attempting,
            Self::Leading(_) => Role::Leading,
            Self::Following(_) => Role::Following,
            Self::Stopped => Role::Stopped,
        }
    }
}

/// The role an agent currently plays, as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Trying the create-if-absent write.
    Attempting,
    /// Holding the leader key.
    Leading,
    /// Waiting for the leader key to be vacated.
    Following,
    /// Shut down; the lease is released and the watch cancelled.
    Stopped,
}

impl Role {
    /// Returns the role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempting => "attempting",
            Self::Leading => "leading",
            Self::Following => "following",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one election attempt.
#[derive(Debug, Clone)]
pub enum ElectionOutcome {
    /// This process created the leader key; the lease keeps it alive.
    Won(Lease),
    /// This process did not become leader.
    Lost(FollowReason),
}

impl ElectionOutcome {
    /// Returns `true` if the attempt won.
    pub fn won(&self) -> bool {
        matches!(self, Self::Won(_))
    }

    /// Returns the lease if the attempt won.
    pub fn lease(&self) -> Option<&Lease> {
        match self {
            Self::Won(lease) => Some(lease),
            Self::Lost(_) => None,
        }
    }

    /// Converts the outcome into the state it leads to.
    pub fn into_state(self) -> ElectionState {
        match self {
            Self::Won(lease) => ElectionState::Leading(lease),
            Self::Lost(reason) => ElectionState::Following(reason),
        }
    }
}

/// Why the leader duties loop ended.
#[derive(Debug, Clone)]
pub enum LeadershipExit {
    /// Shutdown was requested.
    Shutdown,
    /// The lease could not be refreshed.
    RefreshFailed(ElectionError),
    /// The leader work hook returned an error.
    WorkFailed(ElectionError),
}

/// Why the follower wait ended.
#[derive(Debug, Clone)]
pub enum FollowerExit {
    /// A delete notification for the leader key arrived.
    LeaderDeleted,
    /// A poll found the leader key absent without a notification.
    LeaderMissing,
    /// The watch could not be registered; waited one poll interval instead.
    WatchFailed(ElectionError),
    /// Shutdown was requested.
    Shutdown,
}

/// Counters describing what an agent has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionStats {
    /// Election attempts made.
    pub attempts: u64,
    /// Attempts that won the leader key.
    pub elections_won: u64,
    /// Attempts that lost to another holder.
    pub elections_lost: u64,
    /// Attempts that fell back to following because of a coordination error.
    pub connectivity_fallbacks: u64,
    /// Leadership terms that have ended.
    pub leader_terms: u64,
    /// Successful lease refreshes.
    pub refreshes: u64,
    /// Refreshes that failed and ended a term.
    pub refresh_failures: u64,
    /// Times a follower woke up to re-attempt.
    pub follower_wakeups: u64,
    /// Lease revocations that failed (TTL expiry took over).
    pub revoke_failures: u64,
    /// Watch cancellations that failed.
    pub watch_teardown_failures: u64,
}
