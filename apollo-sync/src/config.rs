//! Sync configuration types
//!
//! Defines how configuration services are reached and how fetches and long
//! polls retry. Everything deserializes with serde defaults, so a config file
//! only has to name what differs.

use crate::error::{Result, SyncError};
use crate::identity::{ClientKey, DEFAULT_CLUSTER};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const ENV_CONFIG_SERVER: &str = "APOLLO_CONFIG_SERVER";
pub const ENV_APPID: &str = "APOLLO_APPID";
pub const ENV_CLUSTER: &str = "APOLLO_CLUSTER";
pub const ENV_SECRET_KEY: &str = "APOLLO_SECRET_KEY";

fn default_cluster() -> String {
    DEFAULT_CLUSTER.to_string()
}

/// How to reach one client group on the configuration service
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL, e.g. `http://localhost:8080`
    pub config_server: String,
    pub appid: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// Access key secret; requests are signed when set
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("config_server", &self.config_server)
            .field("appid", &self.appid)
            .field("cluster", &self.cluster)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ClientConfig {
    pub fn new(config_server: impl Into<String>, appid: impl Into<String>) -> Self {
        Self {
            config_server: config_server.into(),
            appid: appid.into(),
            cluster: default_cluster(),
            secret_key: None,
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret_key = Some(secret.into());
        self
    }

    /// Read `APOLLO_CONFIG_SERVER`, `APOLLO_APPID`, `APOLLO_CLUSTER` and
    /// `APOLLO_SECRET_KEY` from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &str| {
            non_empty(name)
                .ok_or_else(|| SyncError::Config(format!("Environment variable {} is not set", name)))
        };

        let config = Self {
            config_server: require(ENV_CONFIG_SERVER)?,
            appid: require(ENV_APPID)?,
            cluster: non_empty(ENV_CLUSTER).unwrap_or_else(default_cluster),
            secret_key: non_empty(ENV_SECRET_KEY),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.config_server.starts_with("http://") || self.config_server.starts_with("https://"))
        {
            return Err(SyncError::Config(format!(
                "config_server must be an http(s) URL, got '{}'",
                self.config_server
            )));
        }
        if self.appid.trim().is_empty() {
            return Err(SyncError::Config("appid must not be empty".to_string()));
        }
        if self.cluster.trim().is_empty() {
            return Err(SyncError::Config("cluster must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn client_key(&self) -> ClientKey {
        ClientKey::new(self.appid.clone(), self.cluster.clone())
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.config_server.trim_end_matches('/')
    }
}

/// Retries of a single namespace fetch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// Long-poll behaviour
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Client-side timeout; the service holds a poll for up to ~90s
    pub request_timeout_secs: u64,
    pub error_base_delay_ms: u64,
    pub error_max_delay_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            request_timeout_secs: 100,
            error_base_delay_ms: 1_000,
            error_max_delay_ms: 60_000,
        }
    }
}

impl PollPolicy {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Namespace fetch behaviour
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    pub request_timeout_secs: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            request_timeout_secs: 5,
        }
    }
}

impl FetchPolicy {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Engine-wide configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Client groups created at construction
    pub remotes: Vec<ClientConfig>,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    pub fetch: FetchPolicy,
}
