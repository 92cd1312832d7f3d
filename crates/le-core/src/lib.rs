//! # le-core
//!
//! Lease-based leader election for Lease Elect.
//!
//! This crate provides the coordination client abstraction (with an in-memory
//! store and an optional etcd backend) and the election agent that decides
//! which of several identical processes is the leader.

pub mod coordination;
pub mod election;

pub use coordination::{
    CoordinationClient, CoordinationError, KeyValue, Lease, LeaseId, MockCoordinationService,
    WatchCallback, WatchEvent, WatchEventKind, WatchId, WatchSubscription,
};
pub use election::{
    ElectionAgent, ElectionConfig, ElectionError, ElectionOutcome, ElectionState, ElectionStats,
    FnLeaderWork, FollowReason, FollowerExit, LeaderContext, LeaderWork, LeadershipExit,
    LoggingLeaderWork, Role,
};

#[cfg(feature = "etcd")]
pub use coordination::EtcdCoordinationClient;
