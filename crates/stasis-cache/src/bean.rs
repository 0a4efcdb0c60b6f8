//! Bean handles.
//!
//! A bean binds one instance id to its metadata view and to a handle on its
//! owning group. Handles are short-lived: one per unit of work, permanently
//! invalid after the first `remove` or `close`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::factory::MetadataFactory;
use crate::group::GroupHandle;
use crate::metadata::{BeanMetadata, ImmutableMetadata};
use crate::types::{BeanId, BeanInstance};

/// Operations on a live bean handle.
pub trait Bean {
    type Id;
    type Instance;

    fn id(&self) -> &Self::Id;

    /// Id of the group that stores this bean's instance.
    fn group_id(&self) -> Self::Id;

    /// The instance, or `None` if its group no longer holds it.
    fn instance(&self) -> Result<Option<Arc<Self::Instance>>>;

    fn metadata(&self) -> ImmutableMetadata<Self::Id>;

    /// Record an access. Written back additively when the bean closes.
    fn set_last_access_time(&self, time: DateTime<Utc>) -> Result<()>;

    fn is_valid(&self) -> bool;

    /// Detach the instance and delete the bean's metadata, handing the
    /// instance to `callback`. Only the first call has any effect.
    fn remove<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Arc<Self::Instance>);

    /// Write back pending access changes and release the group.
    /// Only the first call has any effect.
    fn close(&self) -> Result<()>;
}

/// A bean backed by the metadata store and a group handle.
pub struct CachedBean<K: BeanId, I: BeanInstance> {
    id: K,
    metadata: Mutex<BeanMetadata<K>>,
    metadata_factory: MetadataFactory<K>,
    group: GroupHandle<K, I>,
    valid: AtomicBool,
}

impl<K: BeanId, I: BeanInstance> CachedBean<K, I> {
    pub fn new(
        id: K,
        metadata: BeanMetadata<K>,
        metadata_factory: MetadataFactory<K>,
        group: GroupHandle<K, I>,
    ) -> Self {
        Self {
            id,
            metadata: Mutex::new(metadata),
            metadata_factory,
            group,
            valid: AtomicBool::new(true),
        }
    }

    /// The owning group, for placing the instance.
    pub fn group(&self) -> &GroupHandle<K, I> {
        &self.group
    }

    /// Whether the bean has been idle for at least `timeout` at `now`.
    pub fn is_expired(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        self.metadata.lock().is_expired(timeout, now)
    }

    fn detach<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Arc<I>),
    {
        let instance = self.group.remove_instance(&self.id)?;
        self.metadata_factory.remove(&self.id)?;
        if let Some(instance) = instance {
            callback(instance);
        }
        Ok(())
    }
}

impl<K: BeanId, I: BeanInstance> Bean for CachedBean<K, I> {
    type Id = K;
    type Instance = I;

    fn id(&self) -> &K {
        &self.id
    }

    fn group_id(&self) -> K {
        self.metadata.lock().group_id().clone()
    }

    fn instance(&self) -> Result<Option<Arc<I>>> {
        self.group.get_instance(&self.id)
    }

    fn metadata(&self) -> ImmutableMetadata<K> {
        self.metadata.lock().to_immutable()
    }

    fn set_last_access_time(&self, time: DateTime<Utc>) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Closed(format!("bean {:?}", self.id)));
        }
        self.metadata.lock().set_last_access_time(time)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn remove<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Arc<I>),
    {
        if self
            .valid
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        debug!(bean_id = ?self.id, "Removing bean");
        let detached = self.detach(callback);
        let closed = self.group.close();
        detached?;
        closed
    }

    fn close(&self) -> Result<()> {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self
            .metadata_factory
            .flush(&self.id, &mut self.metadata.lock());
        let closed = self.group.close();
        trace!(bean_id = ?self.id, "Closed bean");
        flushed?;
        closed
    }
}

impl<K: BeanId, I: BeanInstance> Drop for CachedBean<K, I> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(bean_id = ?self.id, error = %e, "Failed to close bean on drop");
        }
    }
}

type CloseTask<B> = Box<dyn FnOnce(&B) + Send>;

/// Runs registered tasks, in order and exactly once, before closing the
/// wrapped bean.
pub struct OnCloseBean<B: Bean> {
    bean: B,
    tasks: Mutex<Vec<CloseTask<B>>>,
}

impl<B: Bean> OnCloseBean<B> {
    pub fn new(bean: B) -> Self {
        Self {
            bean,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a task to run on close.
    pub fn on_close(self, task: impl FnOnce(&B) + Send + 'static) -> Self {
        self.tasks.lock().push(Box::new(task));
        self
    }

    pub fn inner(&self) -> &B {
        &self.bean
    }
}

impl<B: Bean> Bean for OnCloseBean<B> {
    type Id = B::Id;
    type Instance = B::Instance;

    fn id(&self) -> &B::Id {
        self.bean.id()
    }

    fn group_id(&self) -> B::Id {
        self.bean.group_id()
    }

    fn instance(&self) -> Result<Option<Arc<B::Instance>>> {
        self.bean.instance()
    }

    fn metadata(&self) -> ImmutableMetadata<B::Id> {
        self.bean.metadata()
    }

    fn set_last_access_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.bean.set_last_access_time(time)
    }

    fn is_valid(&self) -> bool {
        self.bean.is_valid()
    }

    fn remove<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Arc<B::Instance>),
    {
        self.bean.remove(callback)
    }

    fn close(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task(&self.bean);
        }
        self.bean.close()
    }
}

impl<B: Bean> Drop for OnCloseBean<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close bean on drop");
        }
    }
}

/// A read-only snapshot of a bean.
#[derive(Debug, Clone)]
pub struct ImmutableBean<K, I> {
    id: K,
    metadata: ImmutableMetadata<K>,
    instance: Option<Arc<I>>,
}

impl<K, I> ImmutableBean<K, I> {
    pub fn new(id: K, metadata: ImmutableMetadata<K>, instance: Option<Arc<I>>) -> Self {
        Self {
            id,
            metadata,
            instance,
        }
    }

    pub fn id(&self) -> &K {
        &self.id
    }

    pub fn group_id(&self) -> &K {
        &self.metadata.group_id
    }

    pub fn metadata(&self) -> &ImmutableMetadata<K> {
        &self.metadata
    }

    /// The instance as stored, `None` if its group no longer holds it.
    pub fn instance(&self) -> Option<&Arc<I>> {
        self.instance.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::config::CacheConfig;
    use crate::factory::BeanFactory;
    use crate::group::{GroupEntry, GroupManager};
    use crate::lifecycle::NoPassivation;
    use crate::metadata::MetadataEntry;
    use crate::store::{Creation, InMemoryStore, Store};
    use chrono::TimeDelta;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type MetadataStore = InMemoryStore<String, MetadataEntry<String>>;
    type GroupStore = InMemoryStore<String, GroupEntry>;

    /// Delegates to an in-memory store but fails every `remove`.
    struct FailingRemove(MetadataStore);

    impl Store<String, MetadataEntry<String>> for FailingRemove {
        fn create(
            &self,
            id: &String,
            candidate: MetadataEntry<String>,
        ) -> Result<Creation<MetadataEntry<String>>> {
            self.0.create(id, candidate)
        }

        fn find(&self, id: &String) -> Result<Option<MetadataEntry<String>>> {
            self.0.find(id)
        }

        fn remove(&self, _id: &String) -> Result<bool> {
            Err(Error::Store("unreachable".to_string()))
        }

        fn purge(&self, id: &String) -> Result<bool> {
            self.0.purge(id)
        }

        fn write(&self, id: &String, value: MetadataEntry<String>) -> Result<()> {
            self.0.write(id, value)
        }

        fn remap(
            &self,
            id: &String,
            f: &dyn Fn(&MetadataEntry<String>) -> MetadataEntry<String>,
        ) -> Result<Option<MetadataEntry<String>>> {
            self.0.remap(id, f)
        }
    }

    struct Fixture {
        metadata: Arc<MetadataStore>,
        groups: Arc<GroupStore>,
        factory: BeanFactory<String, u32>,
    }

    fn fixture(config: CacheConfig) -> Fixture {
        let metadata = Arc::new(MetadataStore::new());
        let groups = Arc::new(GroupStore::new());
        let factory = BeanFactory::new(
            MetadataFactory::new(metadata.clone(), &config),
            GroupManager::new(groups.clone(), Arc::new(JsonCodec), Arc::new(NoPassivation)),
        );
        Fixture {
            metadata,
            groups,
            factory,
        }
    }

    fn expiring() -> CacheConfig {
        CacheConfig::new().with_timeout(Duration::from_secs(60))
    }

    fn bean(fixture: &Fixture, id: &str) -> CachedBean<String, u32> {
        let value = fixture
            .factory
            .create_value(&id.to_string(), "g1".to_string())
            .unwrap();
        let bean = fixture.factory.create_bean(id.to_string(), value).unwrap();
        bean.group().add_instance(id.to_string(), 7).unwrap();
        bean
    }

    #[test]
    fn test_remove_is_idempotent() {
        let fixture = fixture(expiring());
        let bean = bean(&fixture, "b1");
        let calls = AtomicUsize::new(0);

        bean.remove(|instance| {
            assert_eq!(*instance, 7);
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        bean.remove(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        bean.close().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!bean.is_valid());
        assert!(fixture.metadata.is_empty());
        // The group was left empty and removed.
        assert!(fixture.groups.is_empty());
        assert_eq!(fixture.groups.stats().removes, 1);
    }

    #[test]
    fn test_close_writes_back_group_and_flushes_offset() {
        let fixture = fixture(expiring());
        let bean = bean(&fixture, "b1");
        let created = bean.metadata().creation_time;

        bean.set_last_access_time(created + TimeDelta::seconds(5))
            .unwrap();
        bean.close().unwrap();
        bean.close().unwrap();

        let stored = fixture.metadata.peek(&"b1".to_string()).unwrap();
        assert_eq!(stored.access().last_access(), Some(Duration::from_secs(5)));
        assert_eq!(fixture.metadata.stats().remaps, 1);
        assert_eq!(fixture.groups.stats().writes, 1);
    }

    #[test]
    fn test_close_without_access_skips_remap() {
        let fixture = fixture(expiring());
        let bean = bean(&fixture, "b1");
        bean.close().unwrap();

        assert_eq!(fixture.metadata.stats().remaps, 0);
    }

    #[test]
    fn test_closed_bean_rejects_access_updates() {
        let fixture = fixture(expiring());
        let bean = bean(&fixture, "b1");
        bean.close().unwrap();

        let err = bean.set_last_access_time(Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }

    #[test]
    fn test_drop_closes_bean() {
        let fixture = fixture(expiring());
        {
            let _bean = bean(&fixture, "b1");
        }
        assert_eq!(fixture.groups.stats().writes, 1);
        assert!(fixture.metadata.peek(&"b1".to_string()).is_some());
    }

    #[test]
    fn test_group_closes_when_metadata_removal_fails() {
        let metadata = Arc::new(FailingRemove(MetadataStore::new()));
        let groups = Arc::new(GroupStore::new());
        let manager = GroupManager::new(groups.clone(), Arc::new(JsonCodec), Arc::new(NoPassivation));
        let factory: BeanFactory<String, u32> = BeanFactory::new(
            MetadataFactory::new(metadata.clone(), &expiring()),
            manager.clone(),
        );

        let value = factory
            .create_value(&"b1".to_string(), "g1".to_string())
            .unwrap();
        let bean = factory.create_bean("b1".to_string(), value).unwrap();
        bean.group().add_instance("b1".to_string(), 7).unwrap();

        let called = AtomicBool::new(false);
        let result = bean.remove(|_| called.store(true, Ordering::SeqCst));

        assert!(matches!(result, Err(Error::Store(_))));
        assert!(!called.load(Ordering::SeqCst));
        assert!(bean.group().is_closed());
        assert!(!manager.is_live(&"g1".to_string()));
        assert!(groups.is_empty());
    }

    #[test]
    fn test_immortal_bean_ignores_access_updates() {
        let fixture = fixture(CacheConfig::new());
        let bean = bean(&fixture, "b1");

        bean.set_last_access_time(Utc::now() + TimeDelta::hours(1))
            .unwrap();
        assert_eq!(bean.metadata().last_access_time, None);
        assert!(!bean.is_expired(Duration::from_secs(1), Utc::now() + TimeDelta::days(1)));
        bean.close().unwrap();

        assert_eq!(fixture.metadata.stats().remaps, 0);
    }

    #[test]
    fn test_on_close_tasks_run_once_in_order() {
        let fixture = fixture(expiring());
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);

        let bean = OnCloseBean::new(bean(&fixture, "b1"))
            .on_close(move |bean: &CachedBean<String, u32>| {
                first.lock().push(("first", bean.is_valid()));
            })
            .on_close(move |_: &CachedBean<String, u32>| {
                second.lock().push(("second", true));
            });

        bean.close().unwrap();
        bean.close().unwrap();
        drop(bean);

        assert_eq!(*order.lock(), vec![("first", true), ("second", true)]);
    }

    #[test]
    fn test_on_close_bean_delegates_remove() {
        let fixture = fixture(expiring());
        let bean = OnCloseBean::new(bean(&fixture, "b1"));

        bean.remove(|_| ()).unwrap();
        assert!(!bean.is_valid());
        assert!(!bean.inner().is_valid());
        assert!(fixture.metadata.is_empty());
    }
}
