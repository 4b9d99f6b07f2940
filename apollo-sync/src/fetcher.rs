//! Namespace fetch with retry
//!
//! Resolves the client group for an identity and retries retryable failures
//! with exponential backoff. Stale-cache fallback is the driver's decision;
//! the fetcher only reports the final error.

use crate::backoff::Backoff;
use crate::client::{ApolloClient, FetchOutcome, NotificationMessages};
use crate::config::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::identity::{ClientKey, NamespaceIdentity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Fetcher {
    clients: RwLock<HashMap<ClientKey, Arc<dyn ApolloClient>>>,
    retry: RetryPolicy,
}

impl Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("clients", &self.clients.read().keys().collect::<Vec<_>>())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Fetcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            retry,
        }
    }

    /// Register the client serving one `(appid, cluster)` group.
    pub fn add_client(&self, client: Arc<dyn ApolloClient>) {
        let key = client.client_key().clone();
        self.clients.write().insert(key, client);
    }

    pub fn client(&self, key: &ClientKey) -> Result<Arc<dyn ApolloClient>> {
        self.clients
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::Config(format!("No client for '{}'", key)))
    }

    pub fn client_keys(&self) -> Vec<ClientKey> {
        let mut keys: Vec<_> = self.clients.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Fetch one namespace, conditional on `release_key`.
    ///
    /// Returns [`SyncError::Cancelled`] as soon as `cancel` fires, dropping any
    /// in-flight request.
    pub async fn fetch(
        &self,
        identity: &NamespaceIdentity,
        release_key: Option<&str>,
        messages: Option<&NotificationMessages>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let client = self.client(&identity.client_key())?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = Backoff::for_retry(&self.retry);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = client.fetch_config(
                    &identity.namespace,
                    identity.label.as_deref(),
                    release_key,
                    messages,
                ) => result,
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        namespace = %identity,
                        attempt,
                        error = %e,
                        "fetch failed, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::debug!(namespace = %identity, attempt, error = %e, "fetch failed");
                    return Err(e);
                }
            }
        }
    }
}
