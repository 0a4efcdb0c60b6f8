//! Reference-counted table of live values keyed by id.
//!
//! Each key is materialized at most once while any reference to it is open.
//! Creation and release for one key are serialized by that key's slot lock,
//! so a new acquire never observes a key while its release is still writing
//! back. The table lock is only held to find, insert or evict slots.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

struct SlotState<V> {
    refs: usize,
    value: Option<Arc<V>>,
    /// Set once the last reference is released; acquirers must start over.
    retired: bool,
}

type Slot<V> = Arc<Mutex<SlotState<V>>>;
type Table<K, V> = Mutex<HashMap<K, Slot<V>>>;

/// Id-keyed table of (value, reference count).
pub struct Registry<K, V> {
    table: Arc<Table<K, V>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently materialized.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.table.lock().contains_key(key)
    }

    /// The live value for `key`, without taking a reference.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let slot = self.table.lock().get(key).cloned()?;
        let state = slot.lock();
        state.value.clone()
    }

    /// Take a reference to `key`, running `create` if it is not materialized.
    ///
    /// Concurrent callers for the same key wait for the first creator and
    /// share its value. If `create` fails no reference is taken.
    pub fn acquire<F>(&self, key: &K, create: F) -> Result<Reference<K, V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let (slot, mut state) = loop {
            let slot = self.slot(key);
            let state = slot.lock_arc();
            if !state.retired {
                break (slot, state);
            }
        };

        state.refs += 1;
        let existing = state.value.clone();
        let value = match existing {
            Some(value) => value,
            None => match create() {
                Ok(value) => {
                    let value = Arc::new(value);
                    state.value = Some(Arc::clone(&value));
                    value
                }
                Err(e) => {
                    state.refs -= 1;
                    if state.refs == 0 {
                        state.retired = true;
                        evict(&self.table, key, &slot);
                    }
                    return Err(e);
                }
            },
        };
        drop(state);

        Ok(Reference {
            key: key.clone(),
            value,
            slot,
            table: Arc::clone(&self.table),
        })
    }

    fn slot(&self, key: &K) -> Slot<V> {
        let mut table = self.table.lock();
        Arc::clone(table.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(SlotState {
                refs: 0,
                value: None,
                retired: false,
            }))
        }))
    }
}

fn evict<K, V>(table: &Table<K, V>, key: &K, slot: &Slot<V>)
where
    K: Eq + Hash,
{
    let mut table = table.lock();
    if table
        .get(key)
        .is_some_and(|current| Arc::ptr_eq(current, slot))
    {
        table.remove(key);
    }
}

/// One open reference to a registry value.
///
/// Must be closed; the last close runs the release callback.
pub struct Reference<K, V> {
    key: K,
    value: Arc<V>,
    slot: Slot<V>,
    table: Arc<Table<K, V>>,
}

impl<K, V> Reference<K, V>
where
    K: Eq + Hash,
{
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    /// Drop this reference. If it was the last one, run `release` on the
    /// value and evict the key; the callback's error is returned, but the
    /// key is evicted either way.
    pub fn close<F>(self, release: F) -> Result<()>
    where
        F: FnOnce(&K, &V) -> Result<()>,
    {
        let mut state = self.slot.lock();
        state.refs -= 1;
        if state.refs > 0 {
            return Ok(());
        }
        state.retired = true;
        let result = match state.value.take() {
            Some(value) => release(&self.key, &value),
            None => Ok(()),
        };
        evict(&self.table, &self.key, &self.slot);
        result
    }
}
