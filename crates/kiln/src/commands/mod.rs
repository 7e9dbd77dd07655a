//! CLI command handlers.

use std::path::PathBuf;

use kiln_config::LoadedConfig;

pub mod check;
pub mod cron;
pub mod render;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Application directory the config was discovered from.
    pub app_dir: PathBuf,
    /// Merged configuration and where it came from.
    pub loaded: LoadedConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}
