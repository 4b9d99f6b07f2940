//! Sync engine lifecycle
//!
//! [`SyncEngine`] owns the client groups, the namespace cache and the binding
//! registry, and runs the background work while started:
//!
//! - `start()` fetches every bound namespace concurrently and applies it to
//!   its bindings. Any failure aborts the start and leaves the engine stopped.
//! - A supervising task then merges one long-poll stream per client group and
//!   spawns a refresh for every reported change.
//! - `stop()` cancels the run, drops the in-flight polls, aborts in-flight
//!   refreshes and waits for all of it to finish. The engine can be started
//!   again afterwards.

use crate::cache::NamespaceCache;
use crate::client::{ApolloClient, HttpApolloClient, NotificationMessages};
use crate::config::{ClientConfig, FetchPolicy, PollPolicy, SyncConfig};
use crate::driver::{RefreshReport, SyncDriver};
use crate::error::{Result, SyncError};
use crate::fetcher::Fetcher;
use crate::identity::{ClientKey, NamespaceIdentity};
use crate::registry::{DispatchOutcome, Registry, SchemaBinding};
use crate::settings::{Settings, TypedBinding};
use crate::watch::{ConfigWatch, WatchEvent};
use crate::watch_poll::LongPollWatch;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

enum RunState {
    Stopped,
    /// Initial fetches in progress
    Starting(CancellationToken),
    Running {
        cancel: CancellationToken,
        supervisor: JoinHandle<()>,
    },
}

impl RunState {
    fn token(&self) -> Option<&CancellationToken> {
        match self {
            RunState::Stopped => None,
            RunState::Starting(cancel) | RunState::Running { cancel, .. } => Some(cancel),
        }
    }
}

/// State shared between the engine and the [`Settings`] handles it gives out
pub(crate) struct EngineShared {
    poll: PollPolicy,
    fetch: FetchPolicy,
    driver: Arc<SyncDriver>,
    state: Mutex<RunState>,
}

impl EngineShared {
    fn running_token(&self) -> Option<CancellationToken> {
        self.state.lock().token().cloned()
    }

    pub(crate) async fn refresh(&self, identity: &NamespaceIdentity) -> Result<RefreshReport> {
        let cancel = self.running_token().ok_or(SyncError::NotStarted)?;
        if !self.driver.registry().contains(identity) {
            return Err(SyncError::Config(format!("Nothing is bound to '{}'", identity)));
        }
        self.driver.refresh(identity, None, &cancel).await
    }

    /// Fetch one namespace at startup and make sure every binding has seen
    /// the cached release, even when the fetch reports no change.
    async fn initial_load(
        &self,
        identity: &NamespaceIdentity,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let outcomes = match self.driver.refresh(identity, None, cancel).await? {
            RefreshReport::Updated { outcomes, .. } => outcomes,
            RefreshReport::Unchanged | RefreshReport::Stale { .. } => {
                match self.driver.cache().get(identity) {
                    Some(entry) => self.driver.registry().notify(identity, &entry.structured),
                    None => Vec::new(),
                }
            }
        };
        first_rejection(outcomes)
    }

    /// Load a binding registered while running.
    async fn load_binding<T>(
        &self,
        identity: &NamespaceIdentity,
        binding: &TypedBinding<T>,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        if self.driver.cache().get(identity).is_none() {
            self.driver.refresh(identity, None, cancel).await?;
        }
        // A refresh running concurrently may already have applied it
        if binding.get().is_none() && binding.last_error().is_none() {
            let entry = self
                .driver
                .cache()
                .get(identity)
                .ok_or_else(|| SyncError::NotReady(binding.name().to_string()))?;
            let _ = binding.apply(&entry.structured);
        }
        match binding.last_error() {
            Some(e) => Err(SyncError::Validation {
                binding: binding.name().to_string(),
                message: e.message,
            }),
            None => Ok(()),
        }
    }
}

/// Unregisters a binding whose `bind` did not complete.
struct BindGuard<'a> {
    registry: &'a Registry,
    name: &'a str,
    armed: bool,
}

impl Drop for BindGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.unregister(self.name);
        }
    }
}

fn first_rejection(outcomes: Vec<DispatchOutcome>) -> Result<()> {
    for outcome in outcomes {
        if let Err(e) = outcome.result {
            return Err(SyncError::Validation {
                binding: outcome.binding,
                message: e.message,
            });
        }
    }
    Ok(())
}

/// Keeps bound settings in sync with the configuration service
pub struct SyncEngine {
    shared: Arc<EngineShared>,
}

impl Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("driver", &self.shared.driver)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncEngine {
    /// Create an engine with an HTTP client for every configured remote.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let fetcher = Fetcher::new(config.retry.clone());
        for remote in &config.remotes {
            let client = HttpApolloClient::with_policies(remote.clone(), &config.fetch, &config.poll)?;
            fetcher.add_client(Arc::new(client));
        }

        let driver = SyncDriver::new(
            fetcher,
            Arc::new(NamespaceCache::new()),
            Arc::new(Registry::new()),
        );
        Ok(Self {
            shared: Arc::new(EngineShared {
                poll: config.poll,
                fetch: config.fetch,
                driver: Arc::new(driver),
                state: Mutex::new(RunState::Stopped),
            }),
        })
    }

    /// Engine for the single client group described by the `APOLLO_*`
    /// environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(SyncConfig {
            remotes: vec![ClientConfig::from_env()?],
            ..SyncConfig::default()
        })
    }

    /// Register the client serving one `(appid, cluster)` group, replacing any
    /// previous one. Groups added while running are polled from the next start.
    pub fn add_client(&self, client: Arc<dyn ApolloClient>) {
        self.shared.driver.fetcher().add_client(client);
    }

    /// Add an HTTP client group.
    pub fn add_remote(&self, config: ClientConfig) -> Result<ClientKey> {
        let key = config.client_key();
        let client = HttpApolloClient::with_policies(config, &self.shared.fetch, &self.shared.poll)?;
        self.add_client(Arc::new(client));
        Ok(key)
    }

    /// Bind typed settings to a namespace.
    ///
    /// While running, the namespace is loaded before this returns; a failure,
    /// or dropping the returned future, unregisters the binding again.
    /// Otherwise loading happens on `start()`.
    pub async fn bind<T>(
        &self,
        name: impl Into<String>,
        identity: NamespaceIdentity,
    ) -> Result<Settings<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let name = name.into();
        self.shared.driver.fetcher().client(&identity.client_key())?;

        let binding = Arc::new(TypedBinding::<T>::new(name.clone()));
        self.shared
            .driver
            .registry()
            .register(identity.clone(), binding.clone())?;

        let mut guard = BindGuard {
            registry: self.shared.driver.registry(),
            name: &name,
            armed: true,
        };
        if let Some(cancel) = self.shared.running_token() {
            self.shared
                .load_binding(&identity, binding.as_ref(), &cancel)
                .await?;
        }
        guard.armed = false;

        Ok(Settings::new(binding, identity, self.shared.clone()))
    }

    pub async fn start(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut state = self.shared.state.lock();
            if !matches!(*state, RunState::Stopped) {
                return Err(SyncError::AlreadyStarted);
            }
            *state = RunState::Starting(cancel.clone());
        }

        let identities = self.shared.driver.registry().identities();
        tracing::info!(namespaces = identities.len(), "starting config sync");

        let results = futures::future::join_all(
            identities
                .iter()
                .map(|identity| self.shared.initial_load(identity, &cancel)),
        )
        .await;
        let failure = results.into_iter().find_map(|r| r.err());

        let mut state = self.shared.state.lock();
        if cancel.is_cancelled() {
            // stop() ran during startup; it cancels under this lock
            return Err(SyncError::Cancelled);
        }
        if let Some(e) = failure {
            cancel.cancel();
            *state = RunState::Stopped;
            tracing::error!(error = %e, "config sync failed to start");
            return Err(e);
        }

        let supervisor = tokio::spawn(supervise(
            self.shared.driver.clone(),
            self.shared.poll.clone(),
            cancel.clone(),
        ));
        *state = RunState::Running { cancel, supervisor };
        tracing::info!("config sync started");
        Ok(())
    }

    /// Stop background work. No request is issued after this returns.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.shared.state.lock();
            if let Some(cancel) = state.token() {
                cancel.cancel();
            }
            std::mem::replace(&mut *state, RunState::Stopped)
        };
        match previous {
            RunState::Running { supervisor, .. } => {
                if let Err(e) = supervisor.await {
                    if e.is_panic() {
                        tracing::error!(error = %e, "config sync supervisor panicked");
                    }
                }
                tracing::info!("config sync stopped");
            }
            RunState::Starting(_) | RunState::Stopped => {}
        }
    }

    /// Refresh one namespace now, bypassing the poll cycle.
    pub async fn refresh(&self, identity: &NamespaceIdentity) -> Result<RefreshReport> {
        self.shared.refresh(identity).await
    }

    /// Look a flat key up across all cached namespaces, in binding order.
    pub fn lookup(&self, key: &str) -> Option<serde_json::Value> {
        let cache = self.shared.driver.cache();
        self.shared
            .driver
            .registry()
            .identities()
            .iter()
            .filter_map(|identity| cache.get(identity))
            .find_map(|entry| entry.structured.lookup(key).map(|node| node.to_json()))
    }

    pub fn cache(&self) -> &Arc<NamespaceCache> {
        self.shared.driver.cache()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.shared.driver.registry()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.shared.state.lock(), RunState::Running { .. })
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.state.lock().token() {
            cancel.cancel();
        }
    }
}

/// Background task of one run: poll every group, refresh what changed.
async fn supervise(driver: Arc<SyncDriver>, poll: PollPolicy, cancel: CancellationToken) {
    let fetcher = driver.fetcher();
    let watches: Vec<_> = fetcher
        .client_keys()
        .iter()
        .filter_map(|key| fetcher.client(key).ok())
        .map(|client| LongPollWatch::new(client, driver.registry().clone(), poll.clone()).watch())
        .collect();

    if watches.is_empty() {
        cancel.cancelled().await;
        return;
    }

    let mut events = futures::stream::select_all(watches);
    let mut refreshes: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(joined) = refreshes.join_next(), if !refreshes.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "refresh task panicked");
                    }
                }
            }

            event = events.next() => match event {
                Some(WatchEvent::Changed { identity, messages }) => {
                    let driver = driver.clone();
                    let cancel = cancel.clone();
                    refreshes.spawn(async move {
                        background_refresh(&driver, &identity, messages, &cancel).await;
                    });
                }
                Some(WatchEvent::Connected { group }) => {
                    tracing::info!(group = %group, "watching for changes");
                }
                Some(WatchEvent::Disconnected { group, reason }) => {
                    tracing::warn!(group = %group, reason = %reason, "long poll disconnected");
                }
                None => break,
            },
        }
    }

    // Dropping the streams abandons in-flight polls
    drop(events);
    refreshes.shutdown().await;
}

async fn background_refresh(
    driver: &SyncDriver,
    identity: &NamespaceIdentity,
    messages: Option<NotificationMessages>,
    cancel: &CancellationToken,
) {
    match driver.refresh(identity, messages, cancel).await {
        Ok(_) | Err(SyncError::Cancelled) => {}
        Err(e) => {
            tracing::error!(namespace = %identity, error = %e, "background refresh failed");
        }
    }
}
