//! Configuration types for the stasis bean cache.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StasisConfig {
    /// Bean cache configuration.
    pub cache: Option<CacheSection>,
}

impl StasisConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        let config: StasisConfig = toml::from_str(toml_str)?;
        if let Some(ref cache) = config.cache {
            cache.validate()?;
        }
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: StasisConfig) {
        match (self.cache.as_mut(), other.cache) {
            (Some(base), Some(layer)) => base.merge(layer),
            (None, Some(layer)) => self.cache = Some(layer),
            (_, None) => {}
        }
    }

    /// Cache section, falling back to defaults when absent.
    pub fn cache_or_default(&self) -> CacheSection {
        self.cache.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Bean name used when `cache.name` is not set.
pub const DEFAULT_CACHE_NAME: &str = "default";

/// Longest accepted idle timeout: one hundred years.
pub const MAX_TIMEOUT_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// How the last-access offset of a bean is rounded before it is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationSetting {
    /// Round sub-millisecond remainders up to the next millisecond.
    #[default]
    Millis,
    /// Round up to whole seconds, never below one second.
    Seconds,
}

/// Bean cache configuration.
///
/// Every key is optional so a layer only overrides what it sets.
///
/// ```toml
/// [cache]
/// name = "cart"
/// timeout_secs = 1800
/// truncation = "seconds"
/// monotonic = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Name recorded in the creation metadata of every bean.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Idle timeout in seconds. Absent means beans never expire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Rounding policy for stored last-access offsets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<TruncationSetting>,
    /// Ignore last-access updates that do not move time forward.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monotonic: Option<bool>,
}

impl CacheSection {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_CACHE_NAME)
    }

    /// Idle timeout as a duration, if beans expire.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn truncation(&self) -> TruncationSetting {
        self.truncation.unwrap_or_default()
    }

    pub fn monotonic(&self) -> bool {
        self.monotonic.unwrap_or(true)
    }

    /// Reject values the cache cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name().trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "cache.name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        match self.timeout_secs {
            Some(0) => Err(ConfigError::Invalid {
                field: "cache.timeout_secs".to_string(),
                reason: "must be positive; omit it for beans that never expire".to_string(),
            }),
            Some(secs) if secs > MAX_TIMEOUT_SECS => Err(ConfigError::Invalid {
                field: "cache.timeout_secs".to_string(),
                reason: format!("must not exceed {MAX_TIMEOUT_SECS}"),
            }),
            _ => Ok(()),
        }
    }

    /// Keys set in `other` replace ours.
    fn merge(&mut self, other: CacheSection) {
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
        if other.truncation.is_some() {
            self.truncation = other.truncation;
        }
        if other.monotonic.is_some() {
            self.monotonic = other.monotonic;
        }
    }
}
