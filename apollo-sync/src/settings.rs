//! Typed settings bound to a namespace
//!
//! [`SyncEngine::bind`](crate::SyncEngine::bind) returns a [`Settings<T>`]
//! handle. Each new release of the namespace is deserialized into `T`; a
//! release that does not fit `T` is rejected as a whole and the previous `T`
//! stays in place.

use crate::engine::EngineShared;
use crate::error::{Result, SyncError};
use crate::identity::NamespaceIdentity;
use crate::registry::{SchemaBinding, ValidationError};
use apollo_keypath::{from_node, StructuredConfig};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// [`SchemaBinding`] that deserializes each snapshot into `T`
pub struct TypedBinding<T> {
    name: String,
    current: RwLock<Option<Arc<T>>>,
    last_error: RwLock<Option<ValidationError>>,
}

impl<T> fmt::Debug for TypedBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedBinding")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .field("loaded", &self.current.read().is_some())
            .field("last_error", &*self.last_error.read())
            .finish()
    }
}

impl<T> TypedBinding<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.current.read().clone()
    }

    /// Error from the most recent apply, cleared by the next successful one.
    pub fn last_error(&self) -> Option<ValidationError> {
        self.last_error.read().clone()
    }
}

impl<T> SchemaBinding for TypedBinding<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, config: &StructuredConfig) -> std::result::Result<(), ValidationError> {
        match from_node::<T>(config) {
            Ok(value) => {
                *self.current.write() = Some(Arc::new(value));
                *self.last_error.write() = None;
                Ok(())
            }
            Err(e) => {
                let err = ValidationError::new(e.to_string());
                *self.last_error.write() = Some(err.clone());
                Err(err)
            }
        }
    }
}

/// Handle to typed settings kept current by a running engine
pub struct Settings<T> {
    binding: Arc<TypedBinding<T>>,
    identity: NamespaceIdentity,
    engine: Arc<EngineShared>,
}

impl<T> Clone for Settings<T> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
            identity: self.identity.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<T> fmt::Debug for Settings<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("identity", &self.identity)
            .field("binding", &self.binding)
            .finish()
    }
}

impl<T> Settings<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(
        binding: Arc<TypedBinding<T>>,
        identity: NamespaceIdentity,
        engine: Arc<EngineShared>,
    ) -> Self {
        Self {
            binding,
            identity,
            engine,
        }
    }

    /// Latest valid settings, `None` before the first successful load.
    pub fn get(&self) -> Option<Arc<T>> {
        self.binding.get()
    }

    /// Latest valid settings, or [`SyncError::NotReady`].
    pub fn require(&self) -> Result<Arc<T>> {
        self.get()
            .ok_or_else(|| SyncError::NotReady(self.binding.name.clone()))
    }

    pub fn identity(&self) -> &NamespaceIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.binding.name
    }

    pub fn last_error(&self) -> Option<ValidationError> {
        self.binding.last_error()
    }

    /// Refresh this namespace now instead of waiting for the next change
    /// notification.
    ///
    /// Fails with [`SyncError::Validation`] when the latest release was
    /// rejected by `T`; the previous settings remain available through
    /// [`get`](Self::get).
    pub async fn refresh(&self) -> Result<Arc<T>> {
        self.engine.refresh(&self.identity).await?;
        if let Some(e) = self.binding.last_error() {
            return Err(SyncError::Validation {
                binding: self.binding.name.clone(),
                message: e.message,
            });
        }
        self.require()
    }
}
