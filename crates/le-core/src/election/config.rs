//! Configuration for an election agent.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ElectionError;

/// Default leader key path.
pub const DEFAULT_LEADER_KEY: &str = "/key/leader";

/// Default lease TTL. A leader that stops refreshing loses the key after this.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

/// Default leader refresh/work cadence.
pub const DEFAULT_LEADER_WORK_INTERVAL: Duration = Duration::from_millis(500);

/// Default follower poll interval.
pub const DEFAULT_FOLLOWER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default pause between losing leadership and the next attempt.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);

/// Default bound on any single coordination request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

fn default_leader_key() -> String {
    DEFAULT_LEADER_KEY.to_string()
}

fn default_lease_ttl() -> Duration {
    DEFAULT_LEASE_TTL
}

fn default_leader_work_interval() -> Duration {
    DEFAULT_LEADER_WORK_INTERVAL
}

fn default_follower_poll_interval() -> Duration {
    DEFAULT_FOLLOWER_POLL_INTERVAL
}

fn default_cooldown() -> Duration {
    DEFAULT_COOLDOWN
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

/// Configuration for an [`ElectionAgent`](super::ElectionAgent).
///
/// The one hard constraint between fields: the leader must refresh its lease
/// well before the TTL runs out, or it risks involuntary demotion.
/// `leader_work_interval` therefore has to stay below `lease_ttl / 2`, which
/// leaves room for at least one missed refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Identity of this process; written as the leader key's value.
    pub instance_id: String,

    /// Path of the leader key in the coordination service.
    #[serde(default = "default_leader_key")]
    pub leader_key: String,

    /// Lease TTL.
    #[serde(default = "default_lease_ttl", with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// How often the leader refreshes its lease and runs one unit of work.
    #[serde(default = "default_leader_work_interval", with = "humantime_serde")]
    pub leader_work_interval: Duration,

    /// How often a follower checks for a vacated leader key.
    #[serde(default = "default_follower_poll_interval", with = "humantime_serde")]
    pub follower_poll_interval: Duration,

    /// Pause after leaving the leader role before attempting again.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Upper bound on every coordination request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl ElectionConfig {
    /// Creates a configuration with the reference defaults.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            leader_key: default_leader_key(),
            lease_ttl: DEFAULT_LEASE_TTL,
            leader_work_interval: DEFAULT_LEADER_WORK_INTERVAL,
            follower_poll_interval: DEFAULT_FOLLOWER_POLL_INTERVAL,
            cooldown: DEFAULT_COOLDOWN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the leader key path.
    pub fn with_leader_key(mut self, key: impl Into<String>) -> Self {
        self.leader_key = key.into();
        self
    }

    /// Sets the lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Sets the leader refresh/work cadence.
    pub fn with_leader_work_interval(mut self, interval: Duration) -> Self {
        self.leader_work_interval = interval;
        self
    }

    /// Sets the follower poll interval.
    pub fn with_follower_poll_interval(mut self, interval: Duration) -> Self {
        self.follower_poll_interval = interval;
        self
    }

    /// Sets the post-leadership cool-down.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// Returns [`ElectionError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.instance_id.trim().is_empty() {
            return Err(ElectionError::invalid_config("instance_id cannot be empty"));
        }

        if self.leader_key.trim().is_empty() {
            return Err(ElectionError::invalid_config("leader_key cannot be empty"));
        }

        for (name, value) in [
            ("lease_ttl", self.lease_ttl),
            ("leader_work_interval", self.leader_work_interval),
            ("follower_poll_interval", self.follower_poll_interval),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ElectionError::invalid_config(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        // Coordination leases are granted in whole seconds.
        if self.lease_ttl.subsec_nanos() != 0 {
            return Err(ElectionError::invalid_config(format!(
                "lease_ttl ({:?}) must be a whole number of seconds",
                self.lease_ttl
            )));
        }

        if self.leader_work_interval >= self.lease_ttl / 2 {
            return Err(ElectionError::invalid_config(format!(
                "leader_work_interval ({:?}) must be less than lease_ttl/2 ({:?})",
                self.leader_work_interval,
                self.lease_ttl / 2
            )));
        }

        if self.request_timeout >= self.lease_ttl {
            return Err(ElectionError::invalid_config(format!(
                "request_timeout ({:?}) must be less than lease_ttl ({:?})",
                self.request_timeout, self.lease_ttl
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_defaults() {
        let config = ElectionConfig::new("server-a");

        assert_eq!(config.instance_id, "server-a");
        assert_eq!(config.leader_key, "/key/leader");
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        assert_eq!(config.leader_work_interval, Duration::from_millis(500));
        assert_eq!(config.follower_poll_interval, Duration::from_secs(1));
        assert_eq!(config.cooldown, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ElectionConfig::new("server-a")
            .with_leader_key("/services/scheduler/leader")
            .with_lease_ttl(Duration::from_secs(30))
            .with_leader_work_interval(Duration::from_secs(5))
            .with_follower_poll_interval(Duration::from_secs(2))
            .with_cooldown(Duration::ZERO)
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.leader_key, "/services/scheduler/leader");
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.cooldown, Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_identity() {
        let err = ElectionConfig::new("  ").validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("instance_id"));

        let err = ElectionConfig::new("a")
            .with_leader_key("")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("leader_key"));
    }

    #[test]
    fn test_validation_rejects_slow_refresh() {
        let err = ElectionConfig::new("a")
            .with_lease_ttl(Duration::from_secs(10))
            .with_leader_work_interval(Duration::from_secs(5))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("leader_work_interval"));
    }

    #[test]
    fn test_validation_rejects_fractional_ttl() {
        let err = ElectionConfig::new("a")
            .with_lease_ttl(Duration::from_millis(2500))
            .with_leader_work_interval(Duration::from_millis(100))
            .with_request_timeout(Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("whole number of seconds"));
    }

    #[test]
    fn test_validation_rejects_long_request_timeout() {
        let err = ElectionConfig::new("a")
            .with_lease_ttl(Duration::from_secs(2))
            .with_leader_work_interval(Duration::from_millis(200))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("request_timeout"));
    }

    #[test]
    fn test_validation_rejects_zero_durations() {
        let err = ElectionConfig::new("a")
            .with_follower_poll_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("follower_poll_interval"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let yaml = r#"
instance_id: server-b
lease_ttl: 20s
leader_work_interval: 2s
"#;
        let config: ElectionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.instance_id, "server-b");
        assert_eq!(config.lease_ttl, Duration::from_secs(20));
        assert_eq!(config.leader_work_interval, Duration::from_secs(2));
        assert_eq!(config.leader_key, DEFAULT_LEADER_KEY);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }
}
