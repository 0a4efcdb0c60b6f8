//! Caller-facing bean manager.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bean::{Bean, CachedBean, OnCloseBean};
use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::expiration::ExpirationTracker;
use crate::factory::{BeanFactory, ImmutableBeanFactory, MetadataFactory};
use crate::group::{GroupEntry, GroupManager, Instances};
use crate::lifecycle::PassivationListener;
use crate::metadata::MetadataEntry;
use crate::store::Store;
use crate::types::{BeanId, BeanInstance};

/// A bean handed out by [`BeanManager`]; closing it re-schedules expiration.
pub type ManagedBean<K, I> = OnCloseBean<CachedBean<K, I>>;

/// Creates and finds beans, and keeps track of which idle beans are due to
/// expire.
///
/// Expiration is only tracked when the configuration has a timeout.
pub struct BeanManager<K: BeanId, I: BeanInstance> {
    config: CacheConfig,
    factory: BeanFactory<K, I>,
    immutable: ImmutableBeanFactory<K, I>,
    tracker: Option<Arc<Mutex<ExpirationTracker<K>>>>,
}

impl<K: BeanId, I: BeanInstance> BeanManager<K, I> {
    pub fn new(
        config: CacheConfig,
        metadata_store: Arc<dyn Store<K, MetadataEntry<K>>>,
        group_store: Arc<dyn Store<K, GroupEntry>>,
        codec: Arc<dyn Codec<Instances<K, I>>>,
        listener: Arc<dyn PassivationListener<I>>,
    ) -> Self {
        let metadata = MetadataFactory::new(metadata_store, &config);
        let groups = GroupManager::new(group_store, codec, listener);
        let immutable = ImmutableBeanFactory::new(&metadata, groups.accessor());
        let tracker = config
            .timeout
            .map(|timeout| Arc::new(Mutex::new(ExpirationTracker::new(timeout))));
        Self {
            factory: BeanFactory::new(metadata, groups),
            immutable,
            tracker,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn factory(&self) -> &BeanFactory<K, I> {
        &self.factory
    }

    /// Read-only factory for listings and diagnostics.
    pub fn immutable(&self) -> &ImmutableBeanFactory<K, I> {
        &self.immutable
    }

    /// Create a bean for `instance`, stored in the group `group_id`.
    pub fn create_bean(&self, id: K, group_id: K, instance: I) -> Result<ManagedBean<K, I>> {
        let value = self.factory.create_value(&id, group_id)?;
        let bean = self.factory.create_bean(id.clone(), value)?;
        if let Err(e) = bean.group().add_instance(id.clone(), instance) {
            if let Err(cleanup) = bean.remove(|_| ()) {
                warn!(bean_id = ?id, error = %cleanup, "Failed to discard bean");
            }
            return Err(e);
        }
        debug!(bean_id = ?id, "Created bean");
        Ok(self.manage(bean))
    }

    /// Look up a bean, or `None` if it no longer exists.
    ///
    /// The bean will not expire until it is closed.
    pub fn find_bean(&self, id: &K) -> Result<Option<ManagedBean<K, I>>> {
        let Some(value) = self.factory.find_value(id)? else {
            return Ok(None);
        };
        if let Some(tracker) = &self.tracker {
            tracker.lock().invalidate(id);
        }
        match self.open_bean(id, value) {
            Ok(Some(bean)) => Ok(Some(self.manage(bean))),
            Ok(None) => Ok(None),
            Err(e) => {
                // Put a suspended id back on the schedule so it can still expire.
                if let Some(tracker) = &self.tracker {
                    let mut tracker = tracker.lock();
                    if tracker.is_tracked(id) {
                        tracker.retry(id.clone());
                    }
                }
                Err(e)
            }
        }
    }

    fn open_bean(&self, id: &K, value: MetadataEntry<K>) -> Result<Option<CachedBean<K, I>>> {
        let bean = self.factory.create_bean(id.clone(), value)?;
        if bean.instance()?.is_some() {
            return Ok(Some(bean));
        }
        debug!(bean_id = ?id, group_id = ?bean.group().id(), "Bean instance missing from its group");
        if let Some(tracker) = &self.tracker {
            tracker.lock().forget(id);
        }
        bean.close()?;
        Ok(None)
    }

    /// Pop the next bean id due to expire at or before `at`.
    pub fn next_expired(&self, at: DateTime<Utc>) -> Option<K> {
        self.tracker.as_ref()?.lock().expired_id(at)
    }

    /// Earliest scheduled expiration.
    pub fn next_expiration(&self) -> Option<DateTime<Utc>> {
        self.tracker.as_ref()?.lock().next_expiration()
    }

    pub fn tracked_ids(&self) -> Vec<K> {
        self.tracker
            .as_ref()
            .map(|tracker| tracker.lock().tracked_ids())
            .unwrap_or_default()
    }

    fn manage(&self, bean: CachedBean<K, I>) -> ManagedBean<K, I> {
        let managed = OnCloseBean::new(bean);
        let Some(tracker) = &self.tracker else {
            return managed;
        };
        let tracker = Arc::clone(tracker);
        managed.on_close(move |bean: &CachedBean<K, I>| {
            let mut tracker = tracker.lock();
            if bean.is_valid() {
                tracker.track(bean.id().clone());
            } else {
                tracker.forget(bean.id());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::lifecycle::NoPassivation;
    use crate::store::InMemoryStore;
    use chrono::TimeDelta;
    use std::time::Duration;

    type MetadataStore = InMemoryStore<String, MetadataEntry<String>>;
    type GroupStore = InMemoryStore<String, GroupEntry>;

    fn id(s: &str) -> String {
        s.to_string()
    }

    fn manager(config: CacheConfig) -> (BeanManager<String, u64>, Arc<GroupStore>) {
        let groups = Arc::new(GroupStore::new());
        let manager = BeanManager::new(
            config,
            Arc::new(MetadataStore::new()),
            groups.clone(),
            Arc::new(JsonCodec),
            Arc::new(NoPassivation),
        );
        (manager, groups)
    }

    fn expiring() -> CacheConfig {
        CacheConfig::new().with_timeout(Duration::from_secs(60))
    }

    #[test]
    fn test_create_then_find() {
        let (manager, _) = manager(expiring());
        manager
            .create_bean(id("b1"), id("g1"), 42)
            .unwrap()
            .close()
            .unwrap();

        let bean = manager.find_bean(&id("b1")).unwrap().unwrap();
        assert_eq!(*bean.instance().unwrap().unwrap(), 42);
        assert_eq!(bean.group_id(), "g1");
        bean.close().unwrap();

        assert!(manager.find_bean(&id("missing")).unwrap().is_none());
    }

    #[test]
    fn test_close_schedules_expiration() {
        let (manager, _) = manager(expiring());
        let before = Utc::now();
        let bean = manager.create_bean(id("b1"), id("g1"), 1).unwrap();
        assert!(manager.tracked_ids().is_empty());

        bean.close().unwrap();
        assert_eq!(manager.tracked_ids(), vec![id("b1")]);

        let due = manager.next_expiration().unwrap();
        assert!(due >= before + TimeDelta::seconds(60));
        assert!(manager.next_expired(before).is_none());
        assert_eq!(manager.next_expired(due), Some(id("b1")));
        assert!(manager.tracked_ids().is_empty());
    }

    #[test]
    fn test_find_suspends_expiration_until_close() {
        let (manager, _) = manager(expiring());
        manager.create_bean(id("b1"), id("g1"), 1).unwrap().close().unwrap();
        assert!(manager.next_expiration().is_some());

        let bean = manager.find_bean(&id("b1")).unwrap().unwrap();
        assert!(manager.next_expiration().is_none());
        assert_eq!(manager.tracked_ids(), vec![id("b1")]);

        drop(bean);
        assert!(manager.next_expiration().is_some());
    }

    #[test]
    fn test_remove_forgets_expiration() {
        let (manager, groups) = manager(expiring());
        manager.create_bean(id("b1"), id("g1"), 1).unwrap().close().unwrap();

        let bean = manager.find_bean(&id("b1")).unwrap().unwrap();
        bean.remove(|_| ()).unwrap();
        bean.close().unwrap();

        assert!(manager.tracked_ids().is_empty());
        assert!(manager.find_bean(&id("b1")).unwrap().is_none());
        assert!(groups.is_empty());
    }

    #[test]
    fn test_missing_instance_yields_none() {
        let (manager, _) = manager(expiring());
        manager.create_bean(id("b1"), id("g1"), 1).unwrap().close().unwrap();

        // Another node dropped the instance but left the metadata behind.
        let group = manager
            .factory()
            .group_manager()
            .get_group(&id("g1"))
            .unwrap();
        group.remove_instance(&id("b1")).unwrap();
        group.close().unwrap();

        assert!(manager.find_bean(&id("b1")).unwrap().is_none());
        assert!(manager.tracked_ids().is_empty());
    }

    struct FailingActivation;

    impl PassivationListener<u64> for FailingActivation {
        fn post_activate(&self, _instance: &u64) -> Result<()> {
            Err(crate::error::Error::Hook("cannot activate".to_string()))
        }
    }

    #[test]
    fn test_failed_find_keeps_bean_scheduled() {
        let manager: BeanManager<String, u64> = BeanManager::new(
            expiring(),
            Arc::new(MetadataStore::new()),
            Arc::new(GroupStore::persistent()),
            Arc::new(JsonCodec),
            Arc::new(FailingActivation),
        );
        manager.create_bean(id("b1"), id("g1"), 1).unwrap().close().unwrap();
        let due = manager.next_expiration().unwrap();

        assert!(manager.find_bean(&id("b1")).is_err());
        assert!(manager.next_expiration().unwrap() >= due);
        assert_eq!(
            manager.next_expired(Utc::now() + TimeDelta::days(1)),
            Some(id("b1"))
        );
    }

    #[test]
    fn test_immortal_beans_are_not_tracked() {
        let (manager, _) = manager(CacheConfig::new());
        manager.create_bean(id("b1"), id("g1"), 1).unwrap().close().unwrap();

        assert!(manager.tracked_ids().is_empty());
        assert!(manager.next_expiration().is_none());
        assert!(manager.next_expired(Utc::now() + TimeDelta::days(365)).is_none());
    }

    #[test]
    fn test_immutable_listing() {
        let (manager, _) = manager(expiring());
        manager.create_bean(id("b1"), id("g1"), 5).unwrap().close().unwrap();

        let bean = manager.immutable().find_bean(&id("b1")).unwrap().unwrap();
        assert_eq!(bean.instance().map(|i| **i), Some(5));
        assert!(bean.metadata().last_access_time.is_some());
    }
}
