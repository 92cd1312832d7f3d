//! Configuration loading for the lease-elect CLI.

use anyhow::{Context, Result};
use le_core::election::{
    ElectionConfig, DEFAULT_COOLDOWN, DEFAULT_FOLLOWER_POLL_INTERVAL, DEFAULT_LEADER_KEY,
    DEFAULT_LEADER_WORK_INTERVAL, DEFAULT_LEASE_TTL, DEFAULT_REQUEST_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Election timing and key settings.
    #[serde(default)]
    pub election: ElectionSettings,

    /// Which coordination service to use and how to reach it.
    #[serde(default)]
    pub coordination: CoordinationSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Loads configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parses configuration from YAML text.
    pub fn parse(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

/// Election settings; everything but the instance name, which comes from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSettings {
    /// Path of the leader key.
    #[serde(default = "default_leader_key")]
    pub leader_key: String,

    /// Lease TTL.
    #[serde(default = "default_lease_ttl", with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// Leader refresh/work cadence.
    #[serde(default = "default_leader_work_interval", with = "humantime_serde")]
    pub leader_work_interval: Duration,

    /// Follower poll interval.
    #[serde(default = "default_follower_poll_interval", with = "humantime_serde")]
    pub follower_poll_interval: Duration,

    /// Pause after losing leadership.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Bound on each coordination request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

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

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            leader_key: default_leader_key(),
            lease_ttl: DEFAULT_LEASE_TTL,
            leader_work_interval: DEFAULT_LEADER_WORK_INTERVAL,
            follower_poll_interval: DEFAULT_FOLLOWER_POLL_INTERVAL,
            cooldown: DEFAULT_COOLDOWN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ElectionSettings {
    /// Builds the agent configuration for the named instance.
    pub fn to_election_config(&self, instance_id: &str) -> ElectionConfig {
        ElectionConfig::new(instance_id)
            .with_leader_key(self.leader_key.clone())
            .with_lease_ttl(self.lease_ttl)
            .with_leader_work_interval(self.leader_work_interval)
            .with_follower_poll_interval(self.follower_poll_interval)
            .with_cooldown(self.cooldown)
            .with_request_timeout(self.request_timeout)
    }
}

/// Coordination backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process store; only agents inside this process can contend.
    Memory,
    /// etcd v3 cluster.
    Etcd,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "etcd" => Ok(Backend::Etcd),
            _ => Err(format!("Invalid backend: {}", s)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Memory => write!(f, "memory"),
            Backend::Etcd => write!(f, "etcd"),
        }
    }
}

/// Coordination service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSettings {
    /// Backend to use.
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// etcd endpoints.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// How often the memory backend expires leases.
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub reaper_interval: Duration,
}

fn default_backend() -> Backend {
    Backend::Memory
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_reaper_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoints: default_endpoints(),
            reaper_interval: default_reaper_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format.
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}
