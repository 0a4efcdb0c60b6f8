//! Backing store primitives.
//!
//! The cache consumes the distributed store through this narrow interface
//! only; replication and transport live behind it.

mod memory;

pub use memory::{InMemoryStore, StoreStats};

use std::fmt::Debug;

use crate::error::{Error, Result};

/// Outcome of a create-if-absent call.
#[derive(Debug, Clone, PartialEq)]
pub enum Creation<V> {
    /// The caller's candidate became the stored value.
    Created(V),
    /// Another creator won; this is its value.
    Existing(V),
}

impl<V> Creation<V> {
    pub fn is_existing(&self) -> bool {
        matches!(self, Creation::Existing(_))
    }

    pub fn into_value(self) -> V {
        match self {
            Creation::Created(value) | Creation::Existing(value) => value,
        }
    }
}

/// Keyed storage for cache records.
///
/// Every call may block on I/O. Failures are reported as [`Error::Store`];
/// the cache never retries.
pub trait Store<K, V>: Send + Sync {
    /// Store `candidate` unless a value already exists.
    ///
    /// All concurrent creators for one id observe the same winning value.
    fn create(&self, id: &K, candidate: V) -> Result<Creation<V>>;

    /// Look up a value, returning `None` on a miss.
    fn find(&self, id: &K) -> Result<Option<V>>;

    /// Look up a value, failing with [`Error::NotFound`] on a miss.
    fn try_find(&self, id: &K) -> Result<V>
    where
        K: Debug,
    {
        self.find(id)?
            .ok_or_else(|| Error::NotFound(format!("{id:?}")))
    }

    /// Remove a value. Returns whether one existed.
    fn remove(&self, id: &K) -> Result<bool>;

    /// Remove a value without notifying store listeners.
    fn purge(&self, id: &K) -> Result<bool>;

    /// Replace the stored value.
    fn write(&self, id: &K, value: V) -> Result<()>;

    /// Atomically replace the stored value with `f(current)`.
    ///
    /// Returns the new value, or `None` if nothing was stored.
    fn remap(&self, id: &K, f: &dyn Fn(&V) -> V) -> Result<Option<V>>;

    /// Whether values outlive this process (passivation to disk or remote nodes).
    fn is_persistent(&self) -> bool {
        false
    }
}

/// A pending full write of an updated value.
pub trait Mutator {
    fn mutate(self) -> Result<()>;
}

/// Writes one value back to a store when mutated.
pub struct EntryMutator<'a, K, V> {
    store: &'a dyn Store<K, V>,
    id: &'a K,
    value: V,
}

impl<'a, K, V> EntryMutator<'a, K, V> {
    pub fn new(store: &'a dyn Store<K, V>, id: &'a K, value: V) -> Self {
        Self { store, id, value }
    }
}

impl<K, V> Mutator for EntryMutator<'_, K, V> {
    fn mutate(self) -> Result<()> {
        self.store.write(self.id, self.value)
    }
}
