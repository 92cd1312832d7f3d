//! # le-observability
//!
//! Logging infrastructure for Lease Elect.
//!
//! Election agents log every state transition with structured fields
//! (`instance_id`, `key`, `lease_id`, `error_kind`), so the subscriber set up
//! here is the main window into which process leads and why it changed.

pub mod logging;

pub use logging::{
    init_logging, init_logging_with_config, try_init_logging_with_config, LoggingConfig,
};
