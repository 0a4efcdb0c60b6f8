//! Bean metadata: immutable creation data plus offset-merged access data.
//!
//! Creation metadata (name, owning group, creation time) is written once.
//! Access metadata is the elapsed time between creation and the last access,
//! stored as a duration so that a write-back only needs to ship the change
//! and the store can add it to whatever it holds by then.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stasis_config::TruncationSetting;

use crate::error::{Error, Result};
use crate::offset::{Offset, OffsetValue, Offsettable, to_delta};

const NANOS_PER_MILLI: u32 = 1_000_000;

/// Rounding applied to the elapsed time since creation before it is stored.
///
/// Grouped and ungrouped deployments historically used different policies,
/// so both are kept and selected through configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Truncation {
    /// Keep whole milliseconds; any sub-millisecond remainder rounds up.
    #[default]
    Millis,
    /// Keep whole seconds; any sub-second remainder rounds up, minimum one second.
    Seconds,
}

impl Truncation {
    pub fn truncate(self, elapsed: Duration) -> Duration {
        match self {
            Truncation::Millis => {
                let remainder = elapsed.subsec_nanos() % NANOS_PER_MILLI;
                if remainder == 0 {
                    elapsed
                } else {
                    elapsed - Duration::from_nanos(u64::from(remainder))
                        + Duration::from_millis(1)
                }
            }
            Truncation::Seconds => {
                let mut seconds = elapsed.as_secs();
                if elapsed.subsec_nanos() > 0 {
                    seconds += 1;
                }
                Duration::from_secs(seconds.max(1))
            }
        }
    }
}

impl From<TruncationSetting> for Truncation {
    fn from(setting: TruncationSetting) -> Self {
        match setting {
            TruncationSetting::Millis => Truncation::Millis,
            TruncationSetting::Seconds => Truncation::Seconds,
        }
    }
}

/// How last-access updates are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    pub truncation: Truncation,
    /// Ignore updates that do not move the last access forward.
    pub monotonic: bool,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            truncation: Truncation::Millis,
            monotonic: true,
        }
    }
}

/// Whether a metadata view may be mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadOnly,
    Mutable,
}

/// Metadata fixed when a bean is first created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationMetadata<K> {
    name: String,
    group_id: K,
    creation_time: DateTime<Utc>,
}

impl<K> CreationMetadata<K> {
    pub fn new(name: impl Into<String>, group_id: K, creation_time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            group_id,
            creation_time,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> &K {
        &self.group_id
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }
}

/// Access metadata, or its absence for beans that never expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMetadata {
    /// Elapsed time between creation and the last access.
    Expiring { last_access: Duration },
    /// Never expires; last access is not tracked.
    Immortal,
}

impl AccessMetadata {
    /// Access metadata for a bean that was just created.
    pub fn expiring() -> Self {
        AccessMetadata::Expiring {
            last_access: Duration::ZERO,
        }
    }

    pub fn last_access(&self) -> Option<Duration> {
        match self {
            AccessMetadata::Expiring { last_access } => Some(*last_access),
            AccessMetadata::Immortal => None,
        }
    }

    /// Add `offset` to the stored elapsed time.
    pub fn remap(&self, offset: &Offset<Duration>) -> Self {
        match self {
            AccessMetadata::Expiring { last_access } => AccessMetadata::Expiring {
                last_access: offset.apply(*last_access),
            },
            AccessMetadata::Immortal => AccessMetadata::Immortal,
        }
    }
}

/// The persisted per-bean record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry<K> {
    creation: CreationMetadata<K>,
    access: AccessMetadata,
}

impl<K> MetadataEntry<K> {
    pub fn new(creation: CreationMetadata<K>, access: AccessMetadata) -> Self {
        Self { creation, access }
    }

    pub fn creation(&self) -> &CreationMetadata<K> {
        &self.creation
    }

    pub fn access(&self) -> &AccessMetadata {
        &self.access
    }

    pub fn group_id(&self) -> &K {
        self.creation.group_id()
    }

    pub fn is_immortal(&self) -> bool {
        matches!(self.access, AccessMetadata::Immortal)
    }

    /// Last access as an instant; creation time for immortal beans.
    pub fn last_access_time(&self) -> DateTime<Utc> {
        let elapsed = self.access.last_access().unwrap_or(Duration::ZERO);
        self.creation.creation_time().shift(to_delta(elapsed))
    }

    /// A new entry with `offset` added to the stored access time.
    ///
    /// Used by the store to merge concurrent writers additively.
    pub fn remap(&self, offset: &Offset<Duration>) -> Self
    where
        K: Clone,
    {
        Self {
            creation: self.creation.clone(),
            access: self.access.remap(offset),
        }
    }

    pub fn to_immutable(&self) -> ImmutableMetadata<K>
    where
        K: Clone,
    {
        ImmutableMetadata {
            name: self.creation.name().to_string(),
            group_id: self.group_id().clone(),
            creation_time: self.creation.creation_time(),
            last_access_time: (!self.is_immortal()).then(|| self.last_access_time()),
        }
    }
}

/// Read-only projection of a bean's metadata for diagnostics and listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImmutableMetadata<K> {
    pub name: String,
    pub group_id: K,
    pub creation_time: DateTime<Utc>,
    /// `None` for beans that never expire.
    pub last_access_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
enum AccessState {
    Expiring(OffsetValue<Duration>),
    Immortal,
}

/// A bean's metadata as seen by one unit of work.
///
/// Last-access changes are kept as an offset from the value read at
/// construction; [`BeanMetadata::pending_offset`] is what gets written back.
#[derive(Debug, Clone)]
pub struct BeanMetadata<K> {
    creation: CreationMetadata<K>,
    access: AccessState,
    policy: AccessPolicy,
    capability: Capability,
}

impl<K: Clone> BeanMetadata<K> {
    pub fn new(entry: MetadataEntry<K>, policy: AccessPolicy, capability: Capability) -> Self {
        let access = match entry.access {
            AccessMetadata::Expiring { last_access } => {
                AccessState::Expiring(OffsetValue::new(last_access))
            }
            AccessMetadata::Immortal => AccessState::Immortal,
        };
        Self {
            creation: entry.creation,
            access,
            policy,
            capability,
        }
    }

    pub fn creation(&self) -> &CreationMetadata<K> {
        &self.creation
    }

    pub fn name(&self) -> &str {
        self.creation.name()
    }

    pub fn group_id(&self) -> &K {
        self.creation.group_id()
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation.creation_time()
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn is_immortal(&self) -> bool {
        matches!(self.access, AccessState::Immortal)
    }

    /// Last access as an instant; creation time for immortal beans.
    pub fn last_access_time(&self) -> DateTime<Utc> {
        match &self.access {
            AccessState::Expiring(value) => self.creation_time().shift(to_delta(value.get())),
            AccessState::Immortal => self.creation_time(),
        }
    }

    /// Record an access at `time`.
    ///
    /// A no-op for immortal beans, and under the monotonic policy for times
    /// not after the current last access.
    pub fn set_last_access_time(&mut self, time: DateTime<Utc>) -> Result<()> {
        if self.capability == Capability::ReadOnly {
            return Err(Error::ReadOnly(format!(
                "metadata of a '{}' bean",
                self.creation.name()
            )));
        }
        let current = self.last_access_time();
        let creation_time = self.creation_time();
        let AccessState::Expiring(value) = &mut self.access else {
            return Ok(());
        };
        if self.policy.monotonic && time <= current {
            return Ok(());
        }
        let elapsed = creation_time
            .delta_to(time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        value.set(self.policy.truncation.truncate(elapsed));
        Ok(())
    }

    /// Offset not yet written back, if any.
    pub fn pending_offset(&self) -> Option<Offset<Duration>> {
        match &self.access {
            AccessState::Expiring(value) if !value.offset().is_zero() => Some(value.offset()),
            _ => None,
        }
    }

    /// Fold the pending offset into the basis after a successful write-back.
    pub fn mark_flushed(&mut self) {
        if let AccessState::Expiring(value) = &mut self.access {
            value.rebase();
        }
    }

    /// Whether the bean has been idle for at least `timeout` at `now`.
    pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        match self.access {
            AccessState::Expiring(_) => self.last_access_time().shift(to_delta(timeout)) <= now,
            AccessState::Immortal => false,
        }
    }

    /// The record as it would look after a write-back.
    pub fn entry(&self) -> MetadataEntry<K> {
        let access = match &self.access {
            AccessState::Expiring(value) => AccessMetadata::Expiring {
                last_access: value.get(),
            },
            AccessState::Immortal => AccessMetadata::Immortal,
        };
        MetadataEntry::new(self.creation.clone(), access)
    }

    pub fn to_immutable(&self) -> ImmutableMetadata<K> {
        self.entry().to_immutable()
    }
}
