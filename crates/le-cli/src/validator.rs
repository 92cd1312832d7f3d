//! Startup validation for the lease-elect CLI.
//!
//! Collects every problem with the merged configuration (file plus flags)
//! before any connection to the coordination service is attempted.

use crate::config::{AppConfig, Backend};
use colored::Colorize;
use le_observability::LoggingConfig;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Critical errors that prevent startup.
    pub errors: Vec<String>,
    /// Warnings that should be addressed but don't prevent startup.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Creates a new empty validation result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Returns true if there are any errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns true if there are any warnings.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Prints the validation result to the console.
    pub fn print(&self) {
        if !self.warnings.is_empty() {
            println!();
            println!("{}", "Configuration Warnings:".yellow().bold());
            for warning in &self.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("{}", "Configuration Errors:".red().bold());
            for error in &self.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        if self.errors.is_empty() && self.warnings.is_empty() {
            println!("  {} Configuration OK", "✓".green());
        }
    }
}

/// Validates application configuration before startup.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the configuration for the named instance.
    pub fn validate(config: &AppConfig, instance_id: &str) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_election(config, instance_id, &mut result);
        Self::validate_coordination(config, &mut result);
        Self::validate_logging(config, &mut result);

        result
    }

    fn validate_election(config: &AppConfig, instance_id: &str, result: &mut ValidationResult) {
        let settings = &config.election;

        if let Err(e) = settings.to_election_config(instance_id).validate() {
            result.add_error(e.to_string());
        }

        if settings.follower_poll_interval >= settings.lease_ttl {
            result.add_warning(format!(
                "follower_poll_interval ({:?}) is not shorter than lease_ttl ({:?}). \
                 Followers may notice a vacated leader key late.",
                settings.follower_poll_interval, settings.lease_ttl
            ));
        }

        if settings.request_timeout > settings.lease_ttl / 2 {
            result.add_warning(format!(
                "request_timeout ({:?}) exceeds half of lease_ttl ({:?}). \
                 A single stalled refresh can cost the leader its lease.",
                settings.request_timeout, settings.lease_ttl
            ));
        }
    }

    fn validate_coordination(config: &AppConfig, result: &mut ValidationResult) {
        let settings = &config.coordination;

        match settings.backend {
            Backend::Memory => {
                result.add_warning(
                    "Using the in-memory coordination backend. Only agents inside this \
                     process can take part in the election.",
                );
                if settings.reaper_interval.is_zero() {
                    result.add_error("coordination.reaper_interval must be greater than zero");
                }
            }
            Backend::Etcd => {
                if !cfg!(feature = "etcd") {
                    result.add_error(
                        "The etcd backend was selected but this binary was built without \
                         the 'etcd' feature. Rebuild with --features etcd.",
                    );
                }

                if settings.endpoints.is_empty() {
                    result.add_error("At least one etcd endpoint is required");
                }

                for endpoint in &settings.endpoints {
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                        result.add_warning(format!(
                            "etcd endpoint '{}' has no http:// or https:// scheme",
                            endpoint
                        ));
                    }
                }
            }
        }
    }

    fn validate_logging(config: &AppConfig, result: &mut ValidationResult) {
        if LoggingConfig::parse_level(&config.logging.level).is_none() {
            result.add_error(format!(
                "Invalid log level '{}'. Expected one of: trace, debug, info, warn, error",
                config.logging.level
            ));
        }
    }
}
