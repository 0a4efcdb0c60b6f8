//! Process-local store.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use super::{Creation, Store};
use crate::error::Result;

/// Counts of store primitive calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// `create` calls that stored the candidate.
    pub created: usize,
    /// `create` calls that returned an existing value.
    pub existing: usize,
    pub finds: usize,
    pub removes: usize,
    pub purges: usize,
    pub writes: usize,
    pub remaps: usize,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    existing: AtomicUsize,
    finds: AtomicUsize,
    removes: AtomicUsize,
    purges: AtomicUsize,
    writes: AtomicUsize,
    remaps: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A store backed by a `HashMap` in this process.
///
/// Non-persistent by default, which disables activation and passivation
/// hooks. [`InMemoryStore::persistent`] reports itself as persistent so the
/// full lifecycle can be exercised without a remote store.
#[derive(Debug)]
pub struct InMemoryStore<K, V> {
    entries: RwLock<HashMap<K, V>>,
    persistent: bool,
    counters: Counters,
}

impl<K, V> Default for InMemoryStore<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            persistent: false,
            counters: Counters::default(),
        }
    }
}

impl<K, V> InMemoryStore<K, V> {
    /// Create a non-persistent store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that reports itself as persistent.
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the call counters.
    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        StoreStats {
            created: c.created.load(Ordering::Relaxed),
            existing: c.existing.load(Ordering::Relaxed),
            finds: c.finds.load(Ordering::Relaxed),
            removes: c.removes.load(Ordering::Relaxed),
            purges: c.purges.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            remaps: c.remaps.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> InMemoryStore<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Read a value without counting the call.
    pub fn peek(&self, id: &K) -> Option<V> {
        self.entries.read().get(id).cloned()
    }

    /// Seed a value without counting the call.
    pub fn insert(&self, id: K, value: V) {
        self.entries.write().insert(id, value);
    }
}

impl<K, V> Store<K, V> for InMemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn create(&self, id: &K, candidate: V) -> Result<Creation<V>> {
        let mut entries = self.entries.write();
        match entries.entry(id.clone()) {
            Entry::Occupied(entry) => {
                bump(&self.counters.existing);
                Ok(Creation::Existing(entry.get().clone()))
            }
            Entry::Vacant(entry) => {
                bump(&self.counters.created);
                entry.insert(candidate.clone());
                trace!(entries = entries.len(), "Stored new record");
                Ok(Creation::Created(candidate))
            }
        }
    }

    fn find(&self, id: &K) -> Result<Option<V>> {
        bump(&self.counters.finds);
        Ok(self.entries.read().get(id).cloned())
    }

    fn remove(&self, id: &K) -> Result<bool> {
        bump(&self.counters.removes);
        Ok(self.entries.write().remove(id).is_some())
    }

    fn purge(&self, id: &K) -> Result<bool> {
        bump(&self.counters.purges);
        Ok(self.entries.write().remove(id).is_some())
    }

    fn write(&self, id: &K, value: V) -> Result<()> {
        bump(&self.counters.writes);
        self.entries.write().insert(id.clone(), value);
        Ok(())
    }

    fn remap(&self, id: &K, f: &dyn Fn(&V) -> V) -> Result<Option<V>> {
        bump(&self.counters.remaps);
        let mut entries = self.entries.write();
        Ok(entries.get_mut(id).map(|value| {
            *value = f(value);
            value.clone()
        }))
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }
}
