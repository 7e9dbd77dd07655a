//! Configuration system for the Kiln application server.
//!
//! Provides TOML-based configuration with:
//! - Evaluator pool, request, session, scheduler and skin settings
//! - Prototype inheritance declarations (`[prototypes]`)
//! - Declarative cron jobs (`[cron.<name>]`)
//! - Config file layering (user config dir + app-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    config_dir, load_config, load_config_file, load_config_with_options, user_config_path,
    ConfigSource, LoadedConfig,
};
pub use error::{ConfigError, Result};
pub use types::*;
