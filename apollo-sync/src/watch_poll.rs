//! Long-poll watch implementation
//!
//! Holds one request open against `/notifications/v2` per client group,
//! carrying every bound namespace with the last notification id seen for it.
//! The service answers 304 when its hold timeout elapses, or 200 with the
//! namespaces that changed, and the poll is re-issued right away either way.
//!
//! The namespace set is re-read from the registry before every poll, so
//! bindings added while running are picked up on the next cycle.

use crate::backoff::Backoff;
use crate::client::{ApolloClient, NotificationRecord, PollOutcome, INITIAL_NOTIFICATION_ID};
use crate::config::PollPolicy;
use crate::registry::Registry;
use crate::watch::WatchEvent;
use futures::Stream;
use std::collections::HashMap;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// How often an idle group (nothing bound) checks the registry again.
const IDLE_RECHECK: Duration = Duration::from_millis(500);

/// Namespace name as bound, ignoring the `.properties` suffix the service
/// may report for the default format.
fn bound_name(reported: &str) -> &str {
    reported.strip_suffix(".properties").unwrap_or(reported)
}

/// Long-poll watch over one client group
#[derive(Debug)]
pub struct LongPollWatch {
    client: Arc<dyn ApolloClient>,
    registry: Arc<Registry>,
    policy: PollPolicy,
}

impl LongPollWatch {
    pub fn new(client: Arc<dyn ApolloClient>, registry: Arc<Registry>, policy: PollPolicy) -> Self {
        Self {
            client,
            registry,
            policy,
        }
    }
}

impl crate::watch::ConfigWatch for LongPollWatch {
    fn watch(&self) -> Pin<Box<dyn Stream<Item = WatchEvent> + Send>> {
        let client = self.client.clone();
        let registry = self.registry.clone();
        let group = client.client_key().clone();
        let mut backoff = Backoff::for_poll(&self.policy);

        let stream = async_stream::stream! {
            let mut notification_ids: HashMap<String, i64> = HashMap::new();
            // None until the first poll completes
            let mut connected: Option<bool> = None;

            loop {
                let namespaces = registry.namespaces_for(&group);
                if namespaces.is_empty() {
                    tokio::time::sleep(IDLE_RECHECK).await;
                    continue;
                }

                let records: Vec<NotificationRecord> = namespaces
                    .iter()
                    .map(|namespace| NotificationRecord {
                        namespace_name: namespace.clone(),
                        notification_id: notification_ids
                            .get(namespace)
                            .copied()
                            .unwrap_or(INITIAL_NOTIFICATION_ID),
                    })
                    .collect();

                match client.poll_notifications(&records).await {
                    Ok(outcome) => {
                        if connected != Some(true) {
                            yield WatchEvent::Connected { group: group.clone() };
                            connected = Some(true);
                        }
                        backoff.reset();

                        if let PollOutcome::Changed(updates) = outcome {
                            for update in updates {
                                let namespace = bound_name(&update.namespace_name).to_string();
                                notification_ids.insert(namespace.clone(), update.notification_id);
                                match registry.identity_for(&group, &namespace) {
                                    Some(identity) => {
                                        yield WatchEvent::Changed {
                                            identity,
                                            messages: update.messages,
                                        };
                                    }
                                    None => {
                                        tracing::debug!(
                                            group = %group,
                                            namespace = %namespace,
                                            "change for unbound namespace ignored"
                                        );
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        if connected != Some(false) {
                            yield WatchEvent::Disconnected {
                                group: group.clone(),
                                reason: format!("Poll failed: {}", e),
                            };
                            connected = Some(false);
                        }

                        let delay = backoff.next_delay();
                        tracing::debug!(group = %group, "Poll retrying in {:?}", delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        Box::pin(stream)
    }
}
