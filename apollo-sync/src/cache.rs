//! Namespace cache
//!
//! Last known release of every namespace: the raw entries, the release key
//! and the assembled tree. Readers get `Arc<CacheEntry>` snapshots; a refresh
//! swaps in a new entry and never mutates one in place.
//!
//! Each identity has its own slot lock. The outer map lock is held only long
//! enough to find or create a slot, so refreshes of different namespaces never
//! wait on each other.

use crate::identity::{NamespaceIdentity, RawConfig};
use apollo_keypath::StructuredConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One cached release
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub raw: Arc<RawConfig>,
    pub structured: Arc<StructuredConfig>,
    /// When this release was stored
    pub last_updated: Instant,
    /// Latest refresh failure since this release was stored
    pub last_error: Option<String>,
}

impl CacheEntry {
    pub fn release_key(&self) -> &str {
        &self.raw.release_key
    }
}

/// What a [`NamespaceCache::put`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// First release for this identity
    Inserted,
    /// A release with a different key replaced the previous one
    Replaced,
    /// Same release key as the cached entry; nothing changed
    Unchanged,
}

impl PutOutcome {
    /// Whether bindings should be notified.
    pub fn is_change(self) -> bool {
        !matches!(self, PutOutcome::Unchanged)
    }
}

type Slot = Arc<RwLock<Option<Arc<CacheEntry>>>>;

#[derive(Debug, Default)]
pub struct NamespaceCache {
    slots: RwLock<HashMap<NamespaceIdentity, Slot>>,
}

impl NamespaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, identity: &NamespaceIdentity) -> Option<Slot> {
        self.slots.read().get(identity).cloned()
    }

    fn slot_or_create(&self, identity: &NamespaceIdentity) -> Slot {
        if let Some(slot) = self.slot(identity) {
            return slot;
        }
        self.slots
            .write()
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    pub fn get(&self, identity: &NamespaceIdentity) -> Option<Arc<CacheEntry>> {
        self.slot(identity)?.read().clone()
    }

    /// Store a release. A put whose release key matches the cached one leaves
    /// the entry (including `last_updated`) untouched.
    pub fn put(
        &self,
        identity: &NamespaceIdentity,
        raw: RawConfig,
        structured: StructuredConfig,
    ) -> PutOutcome {
        let slot = self.slot_or_create(identity);
        let mut guard = slot.write();

        let outcome = match guard.as_ref() {
            None => PutOutcome::Inserted,
            Some(existing) if existing.raw.release_key == raw.release_key => {
                return PutOutcome::Unchanged;
            }
            Some(_) => PutOutcome::Replaced,
        };

        *guard = Some(Arc::new(CacheEntry {
            raw: Arc::new(raw),
            structured: Arc::new(structured),
            last_updated: Instant::now(),
            last_error: None,
        }));
        outcome
    }

    pub fn current_release_key(&self, identity: &NamespaceIdentity) -> Option<String> {
        self.get(identity).map(|entry| entry.raw.release_key.clone())
    }

    /// Attach a refresh failure to an existing entry, keeping its data and
    /// `last_updated`. Returns `false` when nothing is cached.
    pub fn record_error(&self, identity: &NamespaceIdentity, message: impl Into<String>) -> bool {
        let Some(slot) = self.slot(identity) else {
            return false;
        };
        let mut guard = slot.write();
        match guard.as_ref() {
            Some(existing) => {
                let mut entry = CacheEntry::clone(existing);
                entry.last_error = Some(message.into());
                *guard = Some(Arc::new(entry));
                true
            }
            None => false,
        }
    }

    /// Identities with a cached entry.
    pub fn identities(&self) -> Vec<NamespaceIdentity> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.read().is_some())
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.read().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apollo_keypath::assemble_raw;

    fn identity() -> NamespaceIdentity {
        NamespaceIdentity::new("app", "default", "application")
    }

    fn release(key: &str, entries: &[(&str, &str)]) -> (RawConfig, StructuredConfig) {
        let entries: Vec<(String, String)> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let structured = assemble_raw(&entries).unwrap().config;
        (
            RawConfig {
                identity: identity(),
                release_key: key.to_string(),
                entries,
            },
            structured,
        )
    }

    #[test]
    fn test_put_and_get() {
        let cache = NamespaceCache::new();
        assert!(cache.get(&identity()).is_none());

        let (raw, structured) = release("r1", &[("port", "80")]);
        assert_eq!(cache.put(&identity(), raw, structured), PutOutcome::Inserted);

        let entry = cache.get(&identity()).unwrap();
        assert_eq!(entry.release_key(), "r1");
        assert_eq!(
            entry.structured.lookup("port").and_then(|n| n.as_str()),
            Some("80")
        );
        assert_eq!(cache.current_release_key(&identity()), Some("r1".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_same_release_key_is_noop() {
        let cache = NamespaceCache::new();
        let (raw, structured) = release("r1", &[("port", "80")]);
        cache.put(&identity(), raw, structured);
        let before = cache.get(&identity()).unwrap();

        let (raw, structured) = release("r1", &[("port", "81")]);
        assert_eq!(cache.put(&identity(), raw, structured), PutOutcome::Unchanged);

        let after = cache.get(&identity()).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.last_updated, before.last_updated);
    }

    #[test]
    fn test_put_new_release_replaces_and_clears_error() {
        let cache = NamespaceCache::new();
        let (raw, structured) = release("r1", &[("port", "80")]);
        cache.put(&identity(), raw, structured);
        assert!(cache.record_error(&identity(), "timeout"));

        let (raw, structured) = release("r2", &[("port", "81")]);
        assert_eq!(cache.put(&identity(), raw, structured), PutOutcome::Replaced);

        let entry = cache.get(&identity()).unwrap();
        assert_eq!(entry.release_key(), "r2");
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_record_error_keeps_data() {
        let cache = NamespaceCache::new();
        assert!(!cache.record_error(&identity(), "nothing cached"));

        let (raw, structured) = release("r1", &[("port", "80")]);
        cache.put(&identity(), raw, structured);
        let before = cache.get(&identity()).unwrap();

        cache.record_error(&identity(), "connection refused");
        let after = cache.get(&identity()).unwrap();
        assert_eq!(after.last_error.as_deref(), Some("connection refused"));
        assert_eq!(after.release_key(), "r1");
        assert_eq!(after.last_updated, before.last_updated);
        assert!(Arc::ptr_eq(&before.structured, &after.structured));
    }

    #[test]
    fn test_identities_and_clear() {
        let cache = NamespaceCache::new();
        let other = NamespaceIdentity::new("app", "default", "db");
        let (raw, structured) = release("r1", &[]);
        cache.put(&identity(), raw, structured);
        let (raw, structured) = release("r1", &[]);
        cache.put(&other, raw, structured);

        let mut ids = cache.identities();
        ids.sort();
        assert_eq!(ids, vec![identity(), other]);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&identity()).is_none());
    }
}
