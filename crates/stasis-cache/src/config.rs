//! Configuration for the bean cache.

use std::time::Duration;

use stasis_config::{CacheSection, StasisConfig};

use crate::error::Result;
use crate::metadata::{AccessPolicy, Truncation};

/// Default name recorded in bean creation metadata.
pub const DEFAULT_NAME: &str = "default";

/// Default idle timeout (none by default - beans don't expire).
pub const DEFAULT_TIMEOUT: Option<Duration> = None;

/// Configuration for the bean cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Name recorded in the creation metadata of every bean.
    pub name: String,

    /// Idle timeout after which a bean may be expired.
    /// `None` makes beans immortal: access metadata is neither tracked nor stored.
    pub timeout: Option<Duration>,

    /// How last-access updates are rounded and guarded.
    pub access: AccessPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            timeout: DEFAULT_TIMEOUT,
            access: AccessPolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[cache]` section of a loaded config file.
    pub fn from_config(config: &StasisConfig) -> Result<Self> {
        let section = config.cache_or_default();
        section.validate()?;
        Ok(Self::from(&section))
    }

    /// Set the bean name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the idle timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Make beans immortal.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the rounding policy for stored last-access offsets.
    pub fn with_truncation(mut self, truncation: Truncation) -> Self {
        self.access.truncation = truncation;
        self
    }

    /// Enable or disable the monotonic last-access guard.
    pub fn with_monotonic(mut self, monotonic: bool) -> Self {
        self.access.monotonic = monotonic;
        self
    }

    /// Whether beans carry access metadata.
    pub fn is_expiring(&self) -> bool {
        self.timeout.is_some()
    }
}

impl From<&CacheSection> for CacheConfig {
    fn from(section: &CacheSection) -> Self {
        Self {
            name: section.name().to_string(),
            timeout: section.timeout(),
            access: AccessPolicy {
                truncation: section.truncation().into(),
                monotonic: section.monotonic(),
            },
        }
    }
}
