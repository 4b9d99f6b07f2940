//! Change watch trait and event types
//!
//! A `ConfigWatch` yields the namespaces of one client group as the
//! configuration service reports them changed.

use crate::client::NotificationMessages;
use crate::identity::{ClientKey, NamespaceIdentity};
use futures::Stream;
use std::fmt::Debug;
use std::pin::Pin;

/// An event from a config watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A bound namespace has a new release
    Changed {
        identity: NamespaceIdentity,
        messages: Option<NotificationMessages>,
    },
    /// Polling succeeded after startup or an outage
    Connected { group: ClientKey },
    /// Polling failed (will retry with backoff)
    Disconnected { group: ClientKey, reason: String },
}

/// A watch over one client group that yields events as they occur
pub trait ConfigWatch: Debug + Send + Sync {
    /// Start watching and return a stream of events.
    ///
    /// The stream should:
    /// - Emit `Connected` on the first successful poll and after recovery
    /// - Emit `Changed` once per reported namespace
    /// - Emit `Disconnected` once per outage
    /// - Retry with backoff and never end on its own
    ///
    /// Dropping the stream stops the watch and abandons any in-flight request.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;
}
