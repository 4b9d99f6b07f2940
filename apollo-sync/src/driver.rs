//! Refresh pipeline: fetch, assemble, cache, dispatch
//!
//! Every refresh (startup, long-poll change, new binding, manual) runs through
//! [`SyncDriver::refresh`].
//!
//! ## Single-flight per identity
//!
//! At most one refresh runs per identity. A trigger that arrives while one is
//! in flight does not start a second fetch: it marks the slot for one more run
//! and waits for it. Any number of such triggers collapse into that single
//! re-run, which starts after the current one finishes so it observes the
//! newest release. The task that started the first run drives the re-runs;
//! if that task is dropped mid-run, a waiting caller takes over the slot.
//!
//! ## Failure policy
//!
//! A fetch or assembly failure with a cached release keeps serving that
//! release: the error is recorded on the cache entry and the report is
//! [`RefreshReport::Stale`]. Without a cached release the failure is
//! [`SyncError::InitialFetch`].

use crate::cache::NamespaceCache;
use crate::client::{FetchOutcome, NotificationMessages};
use crate::error::{Result, SyncError};
use crate::fetcher::Fetcher;
use crate::identity::NamespaceIdentity;
use crate::registry::{DispatchOutcome, Registry};
use apollo_keypath::assemble_raw;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Result of one refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshReport {
    /// A new release was stored and dispatched to every binding
    Updated {
        release_key: String,
        outcomes: Vec<DispatchOutcome>,
    },
    /// The cached release is current
    Unchanged,
    /// The refresh failed; the previously cached release is still served
    Stale { error: String },
}

impl RefreshReport {
    /// Validation failures from an `Updated` dispatch.
    pub fn rejections(&self) -> impl Iterator<Item = &DispatchOutcome> {
        let outcomes: &[DispatchOutcome] = match self {
            RefreshReport::Updated { outcomes, .. } => outcomes,
            _ => &[],
        };
        outcomes.iter().filter(|o| o.result.is_err())
    }
}

type Waiter = oneshot::Sender<Result<RefreshReport>>;

/// Coalescing state of one identity with a refresh in flight
#[derive(Default)]
struct RefreshSlot {
    /// Set when a trigger arrived during the current run
    rerun: bool,
    /// Notification messages gathered from coalesced triggers
    messages: Option<NotificationMessages>,
    /// Callers waiting for the next run
    waiters: Vec<Waiter>,
}

/// Orchestrates the refresh pipeline for all namespaces
pub struct SyncDriver {
    fetcher: Fetcher,
    cache: Arc<NamespaceCache>,
    registry: Arc<Registry>,
    slots: Mutex<HashMap<NamespaceIdentity, RefreshSlot>>,
}

impl Debug for SyncDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDriver")
            .field("fetcher", &self.fetcher)
            .field("in_flight", &self.slots.lock().len())
            .finish()
    }
}

/// Removes the slot if the driving task is dropped mid-run, which drops the
/// waiters' senders so they observe cancellation.
struct SlotGuard<'a> {
    driver: &'a SyncDriver,
    identity: &'a NamespaceIdentity,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.driver.slots.lock().remove(self.identity);
        }
    }
}

fn merge_messages(
    into: &mut Option<NotificationMessages>,
    messages: Option<NotificationMessages>,
) {
    if let Some(messages) = messages {
        match into {
            Some(existing) => existing.merge(&messages),
            None => *into = Some(messages),
        }
    }
}

impl SyncDriver {
    pub fn new(fetcher: Fetcher, cache: Arc<NamespaceCache>, registry: Arc<Registry>) -> Self {
        Self {
            fetcher,
            cache,
            registry,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn cache(&self) -> &Arc<NamespaceCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Refresh one identity, coalescing with any refresh already in flight.
    pub async fn refresh(
        &self,
        identity: &NamespaceIdentity,
        messages: Option<NotificationMessages>,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport> {
        loop {
            let waiting = {
                let mut slots = self.slots.lock();
                match slots.get_mut(identity) {
                    Some(slot) => {
                        let (tx, rx) = oneshot::channel();
                        slot.rerun = true;
                        merge_messages(&mut slot.messages, messages.clone());
                        slot.waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        slots.insert(identity.clone(), RefreshSlot::default());
                        None
                    }
                }
            };
            // Slot lock released here

            let Some(rx) = waiting else {
                return self.drive(identity, messages, cancel).await;
            };

            tracing::debug!(namespace = %identity, "refresh coalesced into in-flight run");
            match rx.await {
                Ok(result) => return result,
                Err(_) if cancel.is_cancelled() => return Err(SyncError::Cancelled),
                Err(_) => {
                    // The driving caller was dropped before covering this trigger
                    tracing::debug!(namespace = %identity, "in-flight refresh abandoned, retrying");
                }
            }
        }
    }

    /// Run refreshes for a slot this caller owns until no re-run is pending.
    async fn drive(
        &self,
        identity: &NamespaceIdentity,
        messages: Option<NotificationMessages>,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport> {
        let mut guard = SlotGuard {
            driver: self,
            identity,
            armed: true,
        };

        let mut covered: Vec<Waiter> = Vec::new();
        let mut messages = messages;
        // The result returned to this caller is that of the first run
        let mut own: Option<Result<RefreshReport>> = None;

        loop {
            let result = self.run_once(identity, messages.as_ref(), cancel).await;
            for tx in covered.drain(..) {
                let _ = tx.send(result.clone());
            }
            let own = own.get_or_insert(result);

            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(identity) else {
                guard.armed = false;
                return own.clone();
            };
            if !slot.rerun || cancel.is_cancelled() {
                // Waiters still queued are dropped with the slot
                slots.remove(identity);
                guard.armed = false;
                return own.clone();
            }
            slot.rerun = false;
            messages = slot.messages.take();
            covered = std::mem::take(&mut slot.waiters);
        }
    }

    /// One pass of fetch, assemble, store, dispatch.
    async fn run_once(
        &self,
        identity: &NamespaceIdentity,
        messages: Option<&NotificationMessages>,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport> {
        let known = self.cache.current_release_key(identity);

        let raw = match self
            .fetcher
            .fetch(identity, known.as_deref(), messages, cancel)
            .await
        {
            Ok(FetchOutcome::Modified(raw)) => raw,
            Ok(FetchOutcome::NotModified) => return Ok(RefreshReport::Unchanged),
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => return self.fallback(identity, e),
        };

        let assembly = match assemble_raw(&raw.entries) {
            Ok(assembly) => assembly,
            Err(e) => return self.fallback(identity, e.into()),
        };
        for conflict in &assembly.conflicts {
            tracing::warn!(namespace = %identity, "{}", conflict);
        }

        let release_key = raw.release_key.clone();
        let outcome = self.cache.put(identity, raw, assembly.config);
        if !outcome.is_change() {
            return Ok(RefreshReport::Unchanged);
        }

        let Some(entry) = self.cache.get(identity) else {
            return Ok(RefreshReport::Unchanged);
        };
        let outcomes = self.registry.notify(identity, &entry.structured);
        tracing::info!(
            namespace = %identity,
            release_key = %release_key,
            bindings = outcomes.len(),
            "applied release"
        );

        Ok(RefreshReport::Updated {
            release_key,
            outcomes,
        })
    }

    fn fallback(&self, identity: &NamespaceIdentity, error: SyncError) -> Result<RefreshReport> {
        if self.cache.record_error(identity, error.to_string()) {
            tracing::warn!(
                namespace = %identity,
                error = %error,
                "refresh failed, serving cached release"
            );
            Ok(RefreshReport::Stale {
                error: error.to_string(),
            })
        } else {
            Err(SyncError::InitialFetch {
                identity: identity.clone(),
                source: Box::new(error),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::fetcher::tests::{group, MockClient};
    use crate::registry::tests::CountingBinding;
    use apollo_keypath::AssemblyError;
    use std::time::Duration;

    fn identity() -> NamespaceIdentity {
        NamespaceIdentity::in_group(&group(), "application")
    }

    fn setup() -> (Arc<MockClient>, Arc<CountingBinding>, Arc<SyncDriver>) {
        let client = Arc::new(MockClient::new(group()));
        let fetcher = Fetcher::new(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        });
        fetcher.add_client(client.clone());

        let registry = Arc::new(Registry::new());
        let binding = CountingBinding::new("settings");
        registry.register(identity(), binding.clone()).unwrap();

        let driver = Arc::new(SyncDriver::new(
            fetcher,
            Arc::new(NamespaceCache::new()),
            registry,
        ));
        (client, binding, driver)
    }

    fn server_error() -> SyncError {
        SyncError::Http {
            status: 500,
            url: "http://config/configs".to_string(),
        }
    }

    #[tokio::test]
    async fn test_refresh_updates_cache_and_notifies() {
        let (client, binding, driver) = setup();
        client.push_release("application", "r1", &[("a.bb[0]", "1"), ("a.bb[1]", "2")]);

        let report = driver
            .refresh(&identity(), None, &CancellationToken::new())
            .await
            .unwrap();

        let RefreshReport::Updated { release_key, outcomes } = report else {
            panic!("expected Updated, got {:?}", report);
        };
        assert_eq!(release_key, "r1");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(binding.count(), 1);

        let applied = binding.last.lock().clone().unwrap();
        assert_eq!(applied.to_json(), serde_json::json!({"a": {"bb": ["1", "2"]}}));
    }

    #[tokio::test]
    async fn test_refresh_sends_cached_release_key() {
        let (client, binding, driver) = setup();
        client.push_release("application", "r1", &[("k", "v")]);
        client.push_fetch(Ok(FetchOutcome::NotModified));

        let cancel = CancellationToken::new();
        driver.refresh(&identity(), None, &cancel).await.unwrap();
        let report = driver.refresh(&identity(), None, &cancel).await.unwrap();

        assert_eq!(report, RefreshReport::Unchanged);
        assert_eq!(binding.count(), 1);
        assert_eq!(
            client.seen_release_keys.lock().clone(),
            vec![None, Some("r1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_same_release_key_does_not_notify() {
        let (client, binding, driver) = setup();
        client.push_release("application", "r1", &[("k", "v")]);
        client.push_release("application", "r1", &[("k", "v")]);

        let cancel = CancellationToken::new();
        driver.refresh(&identity(), None, &cancel).await.unwrap();
        let before = driver.cache().get(&identity()).unwrap();
        let report = driver.refresh(&identity(), None, &cancel).await.unwrap();

        assert_eq!(report, RefreshReport::Unchanged);
        assert_eq!(binding.count(), 1);
        let after = driver.cache().get(&identity()).unwrap();
        assert_eq!(before.last_updated, after.last_updated);
    }

    #[tokio::test]
    async fn test_stale_fallback_keeps_previous_release() {
        let (client, binding, driver) = setup();
        client.push_release("application", "r1", &[("port", "80")]);
        client.push_fetch(Err(server_error()));

        let cancel = CancellationToken::new();
        driver.refresh(&identity(), None, &cancel).await.unwrap();
        let report = driver.refresh(&identity(), None, &cancel).await.unwrap();

        assert!(matches!(report, RefreshReport::Stale { .. }));
        let entry = driver.cache().get(&identity()).unwrap();
        assert_eq!(entry.release_key(), "r1");
        assert!(entry.last_error.as_deref().unwrap().contains("500"));
        assert_eq!(binding.count(), 1);
        // One initial fetch plus two attempts for the failed refresh
        assert_eq!(client.fetches(), 3);
    }

    #[tokio::test]
    async fn test_initial_failure_is_fatal() {
        let (client, binding, driver) = setup();
        client.push_fetch(Err(server_error()));

        let err = driver
            .refresh(&identity(), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::InitialFetch { .. }));
        assert!(driver.cache().get(&identity()).is_none());
        assert_eq!(binding.count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_release_falls_back() {
        let (client, binding, driver) = setup();
        client.push_release("application", "r1", &[("port", "80")]);
        client.push_release("application", "r2", &[("a..b", "1")]);

        let cancel = CancellationToken::new();
        driver.refresh(&identity(), None, &cancel).await.unwrap();
        let report = driver.refresh(&identity(), None, &cancel).await.unwrap();

        assert!(matches!(report, RefreshReport::Stale { .. }));
        assert_eq!(driver.cache().get(&identity()).unwrap().release_key(), "r1");
        assert_eq!(binding.count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_first_release_is_fatal() {
        let (client, _binding, driver) = setup();
        client.push_release("application", "r1", &[("arr", "[1]"), ("arr[0]", "1")]);

        let err = driver
            .refresh(&identity(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        let SyncError::InitialFetch { source, .. } = err else {
            panic!("expected InitialFetch, got {:?}", err);
        };
        assert!(matches!(
            *source,
            SyncError::MalformedKey(AssemblyError::AmbiguousSequence { .. })
        ));
    }

    /// Client whose fetches block until released, to hold a refresh in flight
    #[derive(Debug)]
    struct GatedClient {
        inner: MockClient,
        gate: tokio::sync::Semaphore,
        in_flight: std::sync::atomic::AtomicUsize,
        max_in_flight: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::client::ApolloClient for GatedClient {
        fn client_key(&self) -> &crate::identity::ClientKey {
            self.inner.client_key()
        }

        async fn fetch_config(
            &self,
            namespace: &str,
            label: Option<&str>,
            release_key: Option<&str>,
            messages: Option<&NotificationMessages>,
        ) -> Result<FetchOutcome> {
            use std::sync::atomic::Ordering;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await;
            let result = self
                .inner
                .fetch_config(namespace, label, release_key, messages)
                .await;
            drop(permit);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn poll_notifications(
            &self,
            notifications: &[crate::client::NotificationRecord],
        ) -> Result<crate::client::PollOutcome> {
            self.inner.poll_notifications(notifications).await
        }
    }

    fn gated_setup() -> (Arc<GatedClient>, Arc<CountingBinding>, Arc<SyncDriver>) {
        let gated = Arc::new(GatedClient {
            inner: MockClient::new(group()),
            gate: tokio::sync::Semaphore::new(0),
            in_flight: std::sync::atomic::AtomicUsize::new(0),
            max_in_flight: std::sync::atomic::AtomicUsize::new(0),
        });
        let fetcher = Fetcher::new(RetryPolicy::default());
        fetcher.add_client(gated.clone());
        let registry = Arc::new(Registry::new());
        let binding = CountingBinding::new("settings");
        registry.register(identity(), binding.clone()).unwrap();
        let driver = Arc::new(SyncDriver::new(
            fetcher,
            Arc::new(NamespaceCache::new()),
            registry,
        ));
        (gated, binding, driver)
    }

    #[tokio::test]
    async fn test_concurrent_triggers_coalesce() {
        use std::sync::atomic::Ordering;

        let (gated, binding, driver) = gated_setup();
        gated.inner.push_release("application", "r1", &[("k", "1")]);
        gated.inner.push_release("application", "r2", &[("k", "2")]);
        let cancel = CancellationToken::new();

        let first = {
            let driver = driver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { driver.refresh(&identity(), None, &cancel).await })
        };
        // Wait until the first fetch is blocked on the gate
        while gated.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let followers: Vec<_> = (0..5)
            .map(|_| {
                let driver = driver.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { driver.refresh(&identity(), None, &cancel).await })
            })
            .collect();
        // Let every follower register on the slot
        tokio::time::sleep(Duration::from_millis(20)).await;

        gated.gate.add_permits(10);

        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, RefreshReport::Updated { ref release_key, .. } if release_key == "r1"));
        for follower in followers {
            let report = follower.await.unwrap().unwrap();
            assert!(
                matches!(report, RefreshReport::Updated { ref release_key, .. } if release_key == "r2")
            );
        }

        // One initial run plus exactly one coalesced re-run
        assert_eq!(gated.inner.fetches(), 2);
        assert_eq!(gated.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(binding.count(), 2);
    }

    #[tokio::test]
    async fn test_waiter_takes_over_when_driving_caller_is_dropped() {
        use std::sync::atomic::Ordering;

        let (gated, binding, driver) = gated_setup();
        gated.inner.push_release("application", "r1", &[("k", "1")]);
        let cancel = CancellationToken::new();

        // A manual refresh that gives up while its fetch is held
        let manual = {
            let driver = driver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_millis(50),
                    driver.refresh(&identity(), None, &cancel),
                )
                .await
            })
        };
        while gated.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // A change notification coalesces onto it
        let background = {
            let driver = driver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { driver.refresh(&identity(), None, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manual.await.unwrap().is_err(), "manual refresh should time out");
        gated.gate.add_permits(10);

        let report = background.await.unwrap().unwrap();
        assert!(matches!(report, RefreshReport::Updated { ref release_key, .. } if release_key == "r1"));
        assert_eq!(gated.inner.fetches(), 1);
        assert_eq!(binding.count(), 1);
        assert_eq!(driver.cache().get(&identity()).unwrap().release_key(), "r1");
    }

    #[tokio::test]
    async fn test_cancelled_refresh_reports_cancelled() {
        let (client, _binding, driver) = setup();
        client.push_release("application", "r1", &[("k", "v")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = driver.refresh(&identity(), None, &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(client.fetches(), 0);
        // Slot is released for later refreshes
        let report = driver
            .refresh(&identity(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(report, RefreshReport::Updated { .. }));
    }
}
