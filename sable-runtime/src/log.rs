//! Logging Infrastructure
//!
//! The runtime emits `tracing` events; this module installs a subscriber for
//! applications that do not bring their own and reports unhandled failures.
//!
//! # Events
//!
//! - `trace`: fiber fork, completion and interruption
//! - `debug`: scheduler, clock and signal lifecycle
//! - `error`: fibers that died while nobody was observing them, and failed
//!   `run_main` programs
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::{config::LogConfig, log};
//!
//! log::init(&LogConfig::default());
//! ```

use tracing_subscriber::EnvFilter;

use crate::cause::Cause;
use crate::config::{LogConfig, LogLevel};
use crate::fiber::FiberId;

/// Install a `tracing-subscriber` fmt subscriber filtered at the configured
/// level. `RUST_LOG` overrides the level when set.
///
/// Returns false if a global subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    if config.level == LogLevel::Off {
        return false;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

/// Report a fiber that died with nobody observing its exit.
pub(crate) fn unhandled_failure<E: std::fmt::Debug>(fiber: FiberId, cause: &Cause<E>) {
    tracing::error!(fiber = %fiber, "fiber failed with an unhandled defect:\n{}", cause.pretty());
}
