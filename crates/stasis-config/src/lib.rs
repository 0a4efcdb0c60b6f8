//! Configuration system for the stasis bean cache.
//!
//! Provides TOML-based configuration with:
//! - A `[cache]` section describing bean naming, idle timeout and the
//!   last-access rounding policy
//! - Config file layering (user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
