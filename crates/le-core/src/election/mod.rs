//! Single-leader election on top of a [`CoordinationClient`](crate::coordination::CoordinationClient).
//!
//! Each process runs an [`ElectionAgent`] that cycles through three states:
//!
//! - **Attempting**: grant a lease, then try to create the leader key bound
//!   to it, guarded by "the key does not exist yet"
//! - **Leading**: refresh the lease and run [`LeaderWork`] on a fixed cadence
//!   until a refresh fails or shutdown is requested, then revoke the lease
//! - **Following**: watch the leader key and go back to attempting once it is
//!   deleted, whether by revocation or TTL expiry
//!
//! The coordination service's transaction is the only arbiter; agents never
//! talk to each other. A leader that is partitioned from the service keeps
//! believing it leads until its next refresh fails, so leader work must be
//! safe to run twice.

mod agent;
mod config;
mod error;
mod state;
mod work;

pub use agent::ElectionAgent;
pub use config::{
    ElectionConfig, DEFAULT_COOLDOWN, DEFAULT_FOLLOWER_POLL_INTERVAL, DEFAULT_LEADER_KEY,
    DEFAULT_LEADER_WORK_INTERVAL, DEFAULT_LEASE_TTL, DEFAULT_REQUEST_TIMEOUT,
};
pub use error::ElectionError;
pub use state::{
    ElectionOutcome, ElectionState, ElectionStats, FollowReason, FollowerExit, LeadershipExit,
    Role,
};
pub use work::{FnLeaderWork, LeaderContext, LeaderWork, LoggingLeaderWork};
