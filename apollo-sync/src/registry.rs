//! Binding registry and change dispatch
//!
//! Tracks which schema bindings are attached to which namespace identity and
//! fans a freshly assembled snapshot out to every binding of that identity.
//!
//! ## Registration rules
//!
//! - Binding names are unique.
//! - Within one client group a namespace may be bound under a single label
//!   only. The notification endpoint reports changes by namespace name, so two
//!   labels of one namespace could not be told apart.
//!
//! The registry does not validate snapshots; [`SchemaBinding::apply`] does.

use crate::error::{Result, SyncError};
use crate::identity::{ClientKey, NamespaceIdentity};
use apollo_keypath::StructuredConfig;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// A snapshot was rejected by a schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A consumer of one namespace's snapshots
///
/// `apply` must be all-or-nothing: on error the previously applied state
/// stays in effect.
pub trait SchemaBinding: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, config: &StructuredConfig) -> std::result::Result<(), ValidationError>;
}

/// Result of applying one snapshot to one binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub binding: String,
    pub result: std::result::Result<(), ValidationError>,
}

#[derive(Debug)]
struct Registration {
    identity: NamespaceIdentity,
    binding: Arc<dyn SchemaBinding>,
}

/// Bindings keyed by name, in registration order
#[derive(Debug, Default)]
pub struct Registry {
    bindings: RwLock<IndexMap<String, Registration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        identity: NamespaceIdentity,
        binding: Arc<dyn SchemaBinding>,
    ) -> Result<()> {
        let name = binding.name().to_string();
        let mut bindings = self.bindings.write();

        if bindings.contains_key(&name) {
            return Err(SyncError::Registration(format!(
                "binding '{}' is already registered",
                name
            )));
        }
        if let Some(existing) = bindings.values().find(|r| {
            r.identity.appid == identity.appid
                && r.identity.cluster == identity.cluster
                && r.identity.namespace == identity.namespace
                && r.identity.label != identity.label
        }) {
            return Err(SyncError::Registration(format!(
                "'{}' conflicts with '{}': a namespace can be bound under one label per client group",
                identity, existing.identity
            )));
        }

        tracing::debug!(binding = %name, namespace = %identity, "registered binding");
        bindings.insert(name, Registration { identity, binding });
        Ok(())
    }

    /// Remove a binding by name. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.bindings.write().shift_remove(name).is_some()
    }

    /// Apply `config` to every binding of `identity`, each exactly once.
    ///
    /// Bindings are snapshotted first so `apply` runs without the registry
    /// lock held.
    pub fn notify(
        &self,
        identity: &NamespaceIdentity,
        config: &StructuredConfig,
    ) -> Vec<DispatchOutcome> {
        self.bindings_for(identity)
            .into_iter()
            .map(|binding| {
                let result = binding.apply(config);
                if let Err(e) = &result {
                    tracing::error!(
                        binding = %binding.name(),
                        namespace = %identity,
                        error = %e,
                        "snapshot rejected, keeping previous settings"
                    );
                }
                DispatchOutcome {
                    binding: binding.name().to_string(),
                    result,
                }
            })
            .collect()
    }

    /// Distinct bound identities, in first registration order.
    pub fn identities(&self) -> Vec<NamespaceIdentity> {
        let bindings = self.bindings.read();
        let mut out: Vec<NamespaceIdentity> = Vec::new();
        for registration in bindings.values() {
            if !out.contains(&registration.identity) {
                out.push(registration.identity.clone());
            }
        }
        out
    }

    /// Distinct namespace names bound in one client group.
    pub fn namespaces_for(&self, key: &ClientKey) -> Vec<String> {
        let bindings = self.bindings.read();
        let mut out: Vec<String> = Vec::new();
        for registration in bindings.values() {
            let identity = &registration.identity;
            if identity.appid == key.appid
                && identity.cluster == key.cluster
                && !out.contains(&identity.namespace)
            {
                out.push(identity.namespace.clone());
            }
        }
        out
    }

    /// The identity bound for `namespace` in a client group, if any.
    pub fn identity_for(&self, key: &ClientKey, namespace: &str) -> Option<NamespaceIdentity> {
        self.bindings
            .read()
            .values()
            .map(|r| &r.identity)
            .find(|identity| {
                identity.appid == key.appid
                    && identity.cluster == key.cluster
                    && identity.namespace == namespace
            })
            .cloned()
    }

    pub fn bindings_for(&self, identity: &NamespaceIdentity) -> Vec<Arc<dyn SchemaBinding>> {
        self.bindings
            .read()
            .values()
            .filter(|r| &r.identity == identity)
            .map(|r| r.binding.clone())
            .collect()
    }

    pub fn contains(&self, identity: &NamespaceIdentity) -> bool {
        self.bindings
            .read()
            .values()
            .any(|r| &r.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}
