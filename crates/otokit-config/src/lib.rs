//! Configuration system for otokit.
//!
//! Provides TOML-based configuration with:
//! - `[session]`: account, endpoints and crawl selection
//! - `[tunnel]`: interface, relay and interception policy
//! - `[callback]` and `[http]`: auth listener and client settings
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
