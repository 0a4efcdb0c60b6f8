//! Bean groups: instances that are stored and passivated as one unit.
//!
//! A group is materialized at most once per process while any handle to it
//! is open. Closing the last handle either removes the group from the store
//! (no instances left) or passivates the instances and writes the group back.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use tracing::{debug, trace, warn};

use crate::codec::{Codec, Marshalled};
use crate::error::{Error, Result};
use crate::lifecycle::{NoPassivation, PassivationListener};
use crate::registry::{Reference, Registry};
use crate::store::{Creation, EntryMutator, Mutator, Store};
use crate::types::{BeanId, BeanInstance};

/// The instances of one group, keyed by bean id.
///
/// Encoded as a sequence of `(id, instance)` pairs so ids need not be strings.
pub struct Instances<K, I>(HashMap<K, Arc<I>>);

impl<K, I> Instances<K, I> {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &Arc<I>)> {
        self.0.iter()
    }

    pub fn into_map(self) -> HashMap<K, Arc<I>> {
        self.0
    }
}

impl<K, I> Default for Instances<K, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, I> Clone for Instances<K, I>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<K: fmt::Debug, I> fmt::Debug for Instances<K, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl<K, I> Serialize for Instances<K, I>
where
    K: Serialize,
    I: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|(id, instance)| (id, instance.as_ref())))
    }
}

impl<'de, K, I> Deserialize<'de> for Instances<K, I>
where
    K: Deserialize<'de> + Eq + Hash,
    I: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let pairs = Vec::<(K, I)>::deserialize(deserializer)?;
        Ok(Self(
            pairs
                .into_iter()
                .map(|(id, instance)| (id, Arc::new(instance)))
                .collect(),
        ))
    }
}

/// A group as held by the store: its encoded instances.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GroupEntry {
    bytes: Vec<u8>,
}

impl GroupEntry {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// In-process state of a materialized group, shared by all its handles.
struct LiveGroup<K, I> {
    contents: Mutex<Marshalled<Instances<K, I>>>,
}

struct Shared<K, I> {
    store: Arc<dyn Store<K, GroupEntry>>,
    codec: Arc<dyn Codec<Instances<K, I>>>,
    listener: Arc<dyn PassivationListener<I>>,
    persistent: bool,
    registry: Registry<K, LiveGroup<K, I>>,
}

impl<K: BeanId, I: BeanInstance> Shared<K, I> {
    fn materialize(&self, id: &K) -> Result<LiveGroup<K, I>> {
        let candidate = GroupEntry::new(self.codec.encode(&Instances::new())?);
        let contents = match self.store.create(id, candidate)? {
            Creation::Created(_) => {
                debug!(group_id = ?id, "Created group");
                Marshalled::decoded(Instances::new())
            }
            Creation::Existing(entry) => {
                let mut contents = Marshalled::encoded(entry.into_bytes());
                if self.persistent {
                    let instances = contents.get_mut(self.codec.as_ref())?;
                    for (_, instance) in instances.iter() {
                        self.listener.post_activate(instance)?;
                    }
                    debug!(group_id = ?id, instances = instances.len(), "Activated group");
                } else {
                    trace!(group_id = ?id, "Found existing group");
                }
                contents
            }
        };
        Ok(LiveGroup {
            contents: Mutex::new(contents),
        })
    }

    fn release(&self, id: &K, group: &LiveGroup<K, I>) -> Result<()> {
        let mut contents = group.contents.lock();
        let instances = contents.get_mut(self.codec.as_ref())?;

        if instances.is_empty() {
            self.store.remove(id)?;
            debug!(group_id = ?id, "Removed empty group");
            return Ok(());
        }

        for (_, instance) in instances.iter() {
            self.listener.pre_passivate(instance)?;
        }
        let count = instances.len();
        let entry = GroupEntry::new(contents.to_bytes(self.codec.as_ref())?);
        EntryMutator::new(self.store.as_ref(), id, entry).mutate()?;
        debug!(group_id = ?id, instances = count, "Wrote back group");
        Ok(())
    }
}

/// Materializes, shares and writes back groups.
pub struct GroupManager<K, I> {
    shared: Arc<Shared<K, I>>,
}

impl<K, I> Clone for GroupManager<K, I> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: BeanId, I: BeanInstance> GroupManager<K, I> {
    /// Create a manager over `store`.
    ///
    /// `listener` only runs when the store is persistent; otherwise
    /// instances never leave memory and the hooks are skipped.
    pub fn new(
        store: Arc<dyn Store<K, GroupEntry>>,
        codec: Arc<dyn Codec<Instances<K, I>>>,
        listener: Arc<dyn PassivationListener<I>>,
    ) -> Self {
        let persistent = store.is_persistent();
        let listener = if persistent {
            listener
        } else {
            Arc::new(NoPassivation)
        };
        Self {
            shared: Arc::new(Shared {
                store,
                codec,
                listener,
                persistent,
                registry: Registry::new(),
            }),
        }
    }

    /// Open a handle to the group, creating it if the store has none.
    ///
    /// Concurrent callers for one id share a single materialization, and
    /// activation hooks run only for the caller that performed it.
    pub fn get_group(&self, id: &K) -> Result<GroupHandle<K, I>> {
        let reference = self
            .shared
            .registry
            .acquire(id, || self.shared.materialize(id))?;
        Ok(GroupHandle {
            group: Arc::clone(reference.value()),
            id: id.clone(),
            reference: Mutex::new(Some(reference)),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Whether the group is materialized in this process.
    pub fn is_live(&self, id: &K) -> bool {
        self.shared.registry.contains(id)
    }

    /// Number of groups materialized in this process.
    pub fn live_groups(&self) -> usize {
        self.shared.registry.len()
    }

    /// A read-only view of this manager.
    pub fn accessor(&self) -> GroupAccessor<K, I> {
        GroupAccessor {
            manager: self.clone(),
        }
    }

    fn find_instances(&self, id: &K) -> Result<Option<HashMap<K, Arc<I>>>> {
        if let Some(group) = self.shared.registry.peek(id) {
            let mut contents = group.contents.lock();
            let instances = contents.get_mut(self.shared.codec.as_ref())?;
            return Ok(Some(instances.0.clone()));
        }
        match self.shared.store.find(id)? {
            Some(entry) => {
                let instances = self.shared.codec.decode(entry.bytes())?;
                Ok(Some(instances.into_map()))
            }
            None => Ok(None),
        }
    }
}

/// Read-only access to groups.
///
/// Never materializes, activates or writes back a group.
pub struct GroupAccessor<K, I> {
    manager: GroupManager<K, I>,
}

impl<K, I> Clone for GroupAccessor<K, I> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<K: BeanId, I: BeanInstance> GroupAccessor<K, I> {
    /// Instances of the group, from memory if it is live, otherwise decoded
    /// from the store.
    pub fn find_instances(&self, id: &K) -> Result<Option<HashMap<K, Arc<I>>>> {
        self.manager.find_instances(id)
    }
}

/// One caller's handle to a materialized group.
///
/// All handles to the same id share the same instances. Closing (or dropping)
/// the last one triggers removal or write-back.
pub struct GroupHandle<K: BeanId, I: BeanInstance> {
    id: K,
    group: Arc<LiveGroup<K, I>>,
    reference: Mutex<Option<Reference<K, LiveGroup<K, I>>>>,
    shared: Arc<Shared<K, I>>,
}

impl<K: BeanId, I: BeanInstance> GroupHandle<K, I> {
    pub fn id(&self) -> &K {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.reference.lock().is_none()
    }

    fn with_instances<R>(&self, f: impl FnOnce(&mut HashMap<K, Arc<I>>) -> R) -> Result<R> {
        if self.is_closed() {
            return Err(Error::Closed(format!("group {:?}", self.id)));
        }
        let mut contents = self.group.contents.lock();
        let instances = contents.get_mut(self.shared.codec.as_ref())?;
        Ok(f(&mut instances.0))
    }

    /// Add an instance, replacing any previous one with the same id.
    pub fn add_instance(&self, id: K, instance: I) -> Result<()> {
        trace!(group_id = ?self.id, bean_id = ?id, "Adding instance to group");
        self.with_instances(|instances| {
            instances.insert(id, Arc::new(instance));
        })
    }

    /// Detach an instance from the group.
    pub fn remove_instance(&self, id: &K) -> Result<Option<Arc<I>>> {
        self.with_instances(|instances| instances.remove(id))
    }

    pub fn get_instance(&self, id: &K) -> Result<Option<Arc<I>>> {
        self.with_instances(|instances| instances.get(id).cloned())
    }

    pub fn instance_ids(&self) -> Result<Vec<K>> {
        self.with_instances(|instances| instances.keys().cloned().collect())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with_instances(|instances| instances.is_empty())
    }

    /// Release this handle. Idempotent.
    pub fn close(&self) -> Result<()> {
        let Some(reference) = self.reference.lock().take() else {
            return Ok(());
        };
        reference.close(|id, group| self.shared.release(id, group))
    }
}

impl<K: BeanId, I: BeanInstance> Drop for GroupHandle<K, I> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(group_id = ?self.id, error = %e, "Failed to close group on drop");
        }
    }
}
