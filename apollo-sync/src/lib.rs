//! Apollo configuration sync
//!
//! Keeps typed in-process settings in sync with an Apollo configuration
//! service. Namespaces are fetched once at startup, then watched with a long
//! poll per `(appid, cluster)` group and re-fetched whenever the service
//! reports a new release.
//!
//! # Architecture
//!
//! - [`engine`]: the [`SyncEngine`] lifecycle (`start` / `bind` / `refresh` / `stop`)
//! - [`settings`]: typed [`Settings`] handles returned by `bind`
//! - [`driver`]: fetch, assemble, cache and dispatch for one namespace, with
//!   concurrent refreshes of the same namespace coalesced
//! - [`fetcher`]: per-group client lookup with retries
//! - [`client`]: the Apollo HTTP protocol (`/configs`, `/notifications/v2`)
//! - [`signing`]: request signing for apps with an access key
//! - [`watch`]: change notification trait, with the long-poll implementation
//!   in [`watch_poll`]
//! - [`cache`]: last good release per namespace
//! - [`registry`]: which bindings are attached to which namespace
//! - [`config`], [`identity`], [`backoff`], [`error`], [`telemetry`]
//!
//! Key path parsing, tree assembly and typed deserialization live in the
//! `apollo-keypath` crate, which does no I/O.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod registry;
pub mod settings;
pub mod signing;
pub mod telemetry;
pub mod watch;
pub mod watch_poll;

pub use apollo_keypath::{ConfigNode, StructuredConfig};
pub use cache::{CacheEntry, NamespaceCache};
pub use client::{ApolloClient, FetchOutcome, HttpApolloClient, NotificationMessages, PollOutcome};
pub use config::{ClientConfig, FetchPolicy, PollPolicy, RetryPolicy, SyncConfig};
pub use driver::{RefreshReport, SyncDriver};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use identity::{ClientKey, NamespaceIdentity, RawConfig, DEFAULT_CLUSTER, DEFAULT_NAMESPACE};
pub use registry::{DispatchOutcome, Registry, SchemaBinding, ValidationError};
pub use settings::{Settings, TypedBinding};
pub use telemetry::{init_logging, LogConfig};
pub use watch::{ConfigWatch, WatchEvent};
