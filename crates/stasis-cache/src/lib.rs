//! Clustered bean cache with group write-back and offset-merged access times.
//!
//! This crate keeps stateful bean instances resumable across a farm of nodes:
//! - Groups bundle related instances into one stored unit, materialized at
//!   most once per process and written back (or removed) on last release
//! - Access metadata is merged by additive offsets, so concurrent
//!   last-access updates from different nodes compose instead of overwrite
//! - Beans that never expire skip access metadata entirely
//! - Idle beans are tracked for expiration by the [`BeanManager`]
//!
//! # Example
//!
//! ```rust,ignore
//! use stasis_cache::{BeanManager, CacheConfig, InMemoryStore, JsonCodec, NoPassivation};
//!
//! let config = CacheConfig::new().with_timeout(Duration::from_secs(600));
//! let manager = BeanManager::new(
//!     config,
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(JsonCodec),
//!     Arc::new(NoPassivation),
//! );
//!
//! let bean = manager.create_bean(id, group_id, instance)?;
//! bean.set_last_access_time(Utc::now())?;
//! bean.close()?;
//! ```

mod bean;
mod codec;
mod config;
mod error;
mod expiration;
mod factory;
mod group;
mod lifecycle;
mod manager;
mod metadata;
mod offset;
mod registry;
mod store;
mod types;

pub use bean::{Bean, CachedBean, ImmutableBean, OnCloseBean};
pub use codec::{Codec, JsonCodec, Marshalled};
pub use config::{CacheConfig, DEFAULT_NAME, DEFAULT_TIMEOUT};
pub use error::{Error, Result};
pub use expiration::ExpirationTracker;
pub use factory::{BeanFactory, ImmutableBeanFactory, MetadataFactory};
pub use group::{GroupAccessor, GroupEntry, GroupHandle, GroupManager, Instances};
pub use lifecycle::{NoPassivation, PassivationListener};
pub use manager::{BeanManager, ManagedBean};
pub use metadata::{
    AccessMetadata, AccessPolicy, BeanMetadata, Capability, CreationMetadata, ImmutableMetadata,
    MetadataEntry, Truncation,
};
pub use offset::{Offset, OffsetValue, Offsettable};
pub use store::{Creation, EntryMutator, InMemoryStore, Mutator, Store, StoreStats};
pub use types::{BeanId, BeanInstance};
