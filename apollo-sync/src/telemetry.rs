//! Logging setup
//!
//! The library only emits `tracing` events. Applications that do not install
//! their own subscriber can call [`init_logging`].

use std::env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fallback level variable, read when `RUST_LOG` is unset
pub const ENV_LOG_LEVEL: &str = "APOLLO_LOG_LEVEL";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Full filter directive (RUST_LOG env var)
    pub filter: Option<String>,
    /// Level used when no filter is set
    pub default_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }
}

impl LogConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup("RUST_LOG").filter(|f| !f.trim().is_empty());
        let default_level = lookup(ENV_LOG_LEVEL)
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        Self {
            filter,
            default_level,
        }
    }

    /// Debug output for this crate, info for everything else.
    pub fn debug() -> Self {
        Self {
            filter: Some("info,apollo_sync=debug,apollo_keypath=debug".to_string()),
            default_level: "debug".to_string(),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        match &self.filter {
            Some(filter) => EnvFilter::new(filter),
            None => EnvFilter::new(&self.default_level),
        }
    }
}

/// Install a compact fmt subscriber.
///
/// Safe to call multiple times - will only initialize once.
pub fn init_logging(config: &LogConfig) {
    if tracing::dispatcher::has_been_set() {
        tracing::debug!("tracing subscriber already initialized, skipping");
        return;
    }

    let fmt_layer = tracing_subscriber::fmt::layer().compact();

    // Another thread may have installed one since the check above
    let _ = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(fmt_layer)
        .try_init();
}
