//! Metadata and bean factories.
//!
//! The metadata factory owns the per-bean records in the metadata store and
//! merges access-time changes into them by offset. The bean factory pairs it
//! with a group manager to hand out [`CachedBean`] handles; the immutable
//! bean factory is the read-only counterpart used for listings.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace};

use crate::bean::{CachedBean, ImmutableBean};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::group::{GroupAccessor, GroupManager};
use crate::metadata::{
    AccessMetadata, AccessPolicy, BeanMetadata, Capability, CreationMetadata, MetadataEntry,
};
use crate::store::Store;
use crate::types::{BeanId, BeanInstance};

struct MetadataShared<K> {
    store: Arc<dyn Store<K, MetadataEntry<K>>>,
    name: String,
    policy: AccessPolicy,
    expiring: bool,
}

/// Creates, finds and removes bean metadata records.
pub struct MetadataFactory<K> {
    shared: Arc<MetadataShared<K>>,
    capability: Capability,
}

impl<K> Clone for MetadataFactory<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            capability: self.capability,
        }
    }
}

impl<K: BeanId> MetadataFactory<K> {
    pub fn new(store: Arc<dyn Store<K, MetadataEntry<K>>>, config: &CacheConfig) -> Self {
        Self {
            shared: Arc::new(MetadataShared {
                store,
                name: config.name.clone(),
                policy: config.access,
                expiring: config.is_expiring(),
            }),
            capability: Capability::Mutable,
        }
    }

    /// A factory that can only read.
    pub fn read_only(store: Arc<dyn Store<K, MetadataEntry<K>>>, config: &CacheConfig) -> Self {
        Self::new(store, config).to_read_only()
    }

    /// A read-only view over the same store.
    pub fn to_read_only(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            capability: Capability::ReadOnly,
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn is_expiring(&self) -> bool {
        self.shared.expiring
    }

    fn check_mutable(&self, id: &K) -> Result<()> {
        match self.capability {
            Capability::Mutable => Ok(()),
            Capability::ReadOnly => Err(Error::ReadOnly(format!("metadata of bean {id:?}"))),
        }
    }

    /// Create the metadata record for a new bean owned by `group_id`.
    ///
    /// If another caller created the record first, theirs is returned.
    pub fn create_value(&self, id: &K, group_id: K) -> Result<MetadataEntry<K>> {
        self.check_mutable(id)?;
        let access = if self.shared.expiring {
            AccessMetadata::expiring()
        } else {
            AccessMetadata::Immortal
        };
        let creation = CreationMetadata::new(self.shared.name.as_str(), group_id, Utc::now());
        let created = self
            .shared
            .store
            .create(id, MetadataEntry::new(creation, access))?;
        if created.is_existing() {
            debug!(bean_id = ?id, "Metadata already existed");
        }
        Ok(created.into_value())
    }

    pub fn find_value(&self, id: &K) -> Result<Option<MetadataEntry<K>>> {
        self.shared.store.find(id)
    }

    /// Like [`find_value`](Self::find_value), but a miss is [`Error::NotFound`].
    pub fn try_value(&self, id: &K) -> Result<MetadataEntry<K>> {
        self.shared.store.try_find(id)
    }

    /// A view of `entry` with this factory's access policy and capability.
    pub fn create_metadata(&self, entry: MetadataEntry<K>) -> BeanMetadata<K> {
        BeanMetadata::new(entry, self.shared.policy, self.capability)
    }

    /// Merge the view's pending access offset into the stored record.
    ///
    /// Returns whether anything was written.
    pub fn flush(&self, id: &K, metadata: &mut BeanMetadata<K>) -> Result<bool> {
        let Some(offset) = metadata.pending_offset() else {
            return Ok(false);
        };
        self.check_mutable(id)?;
        let merged = self
            .shared
            .store
            .remap(id, &|entry: &MetadataEntry<K>| entry.remap(&offset))?;
        match merged {
            Some(_) => {
                metadata.mark_flushed();
                trace!(bean_id = ?id, offset = ?offset, "Merged access offset");
                Ok(true)
            }
            None => {
                debug!(bean_id = ?id, "Metadata vanished before access offset was merged");
                Ok(false)
            }
        }
    }

    pub fn remove(&self, id: &K) -> Result<bool> {
        self.check_mutable(id)?;
        self.shared.store.remove(id)
    }

    pub fn purge(&self, id: &K) -> Result<bool> {
        self.check_mutable(id)?;
        self.shared.store.purge(id)
    }
}

/// Composes metadata and groups into bean handles.
pub struct BeanFactory<K, I> {
    metadata: MetadataFactory<K>,
    groups: GroupManager<K, I>,
}

impl<K, I> Clone for BeanFactory<K, I> {
    fn clone(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            groups: self.groups.clone(),
        }
    }
}

impl<K: BeanId, I: BeanInstance> BeanFactory<K, I> {
    pub fn new(metadata: MetadataFactory<K>, groups: GroupManager<K, I>) -> Self {
        Self { metadata, groups }
    }

    pub fn metadata_factory(&self) -> &MetadataFactory<K> {
        &self.metadata
    }

    pub fn group_manager(&self) -> &GroupManager<K, I> {
        &self.groups
    }

    pub fn create_value(&self, id: &K, group_id: K) -> Result<MetadataEntry<K>> {
        self.metadata.create_value(id, group_id)
    }

    /// Bind `value` to a handle on its owning group.
    pub fn create_bean(&self, id: K, value: MetadataEntry<K>) -> Result<CachedBean<K, I>> {
        let group = self.groups.get_group(value.group_id())?;
        let metadata = self.metadata.create_metadata(value);
        Ok(CachedBean::new(id, metadata, self.metadata.clone(), group))
    }

    pub fn find_value(&self, id: &K) -> Result<Option<MetadataEntry<K>>> {
        self.metadata.find_value(id)
    }

    pub fn try_value(&self, id: &K) -> Result<MetadataEntry<K>> {
        self.metadata.try_value(id)
    }

    /// Remove the bean's metadata record. The group is left alone.
    pub fn remove(&self, id: &K) -> Result<bool> {
        self.metadata.remove(id)
    }

    /// Purge the metadata record and drop the instance from its group.
    ///
    /// The group's own record is removed if that leaves it empty.
    pub fn purge(&self, id: &K) -> Result<bool> {
        let Some(entry) = self.metadata.find_value(id)? else {
            return Ok(false);
        };
        // A failed activation must leave the metadata in place.
        let group = self.groups.get_group(entry.group_id())?;
        let purged = self.metadata.purge(id)?;
        let detached = group.remove_instance(id);
        let closed = group.close();
        detached?;
        closed?;
        debug!(bean_id = ?id, group_id = ?entry.group_id(), "Purged bean");
        Ok(purged)
    }
}

/// Read-only bean factory.
///
/// Never creates metadata, mutates access offsets or writes back a group.
pub struct ImmutableBeanFactory<K, I> {
    metadata: MetadataFactory<K>,
    groups: GroupAccessor<K, I>,
}

impl<K, I> Clone for ImmutableBeanFactory<K, I> {
    fn clone(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            groups: self.groups.clone(),
        }
    }
}

impl<K: BeanId, I: BeanInstance> ImmutableBeanFactory<K, I> {
    pub fn new(metadata: &MetadataFactory<K>, groups: GroupAccessor<K, I>) -> Self {
        Self {
            metadata: metadata.to_read_only(),
            groups,
        }
    }

    pub fn find_value(&self, id: &K) -> Result<Option<MetadataEntry<K>>> {
        self.metadata.find_value(id)
    }

    pub fn try_value(&self, id: &K) -> Result<MetadataEntry<K>> {
        self.metadata.try_value(id)
    }

    pub fn create_bean(&self, id: K, value: MetadataEntry<K>) -> Result<ImmutableBean<K, I>> {
        let instance = self
            .groups
            .find_instances(value.group_id())?
            .and_then(|mut instances| instances.remove(&id));
        Ok(ImmutableBean::new(id, value.to_immutable(), instance))
    }

    /// Snapshot of the bean, or `None` if it has no metadata.
    pub fn find_bean(&self, id: &K) -> Result<Option<ImmutableBean<K, I>>> {
        match self.find_value(id)? {
            Some(value) => self.create_bean(id.clone(), value).map(Some),
            None => Ok(None),
        }
    }
}
