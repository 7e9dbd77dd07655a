//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/kiln/config.toml` (user config)
//! 2. `<app dir>/kiln.toml` (application-local)
//! 3. CLI arguments (handled externally)

use std::path::{Path, PathBuf};

use crate::{AppConfig, ConfigError, Result};

/// Default config filename inside an application directory.
const APP_CONFIG_FILE: &str = "kiln.toml";

/// Default config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Directory name for platform config resolution.
const APP_NAME: &str = "kiln";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "KILN_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: AppConfig,
    /// Sources that were checked, in order of precedence (lowest first).
    pub sources: Vec<ConfigSource>,
    /// Warnings generated during loading (unparseable layers, failed validation).
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration by discovering and merging all config layers.
pub fn load_config(app_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(app_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `KILN_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    app_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = AppConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    let app_path = app_dir
        .map(|d| d.join(APP_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(APP_CONFIG_FILE));
    sources.push(load_layer(&mut config, &app_path, &mut warnings));

    if let Err(e) = config.validate() {
        warnings.push(e.to_string());
    }

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    AppConfig::from_toml(&contents)
}

/// Path of the user config file.
pub fn user_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// The user config directory.
///
/// Checks `KILN_CONFIG_DIR` first, then falls back to the platform default.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

fn load_layer(config: &mut AppConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    let loaded = if path.is_file() {
        match load_config_file(path) {
            Ok(layer) => {
                config.merge(layer);
                true
            }
            Err(e) => {
                warnings.push(format!("Failed to load {}: {}", path.display(), e));
                false
            }
        }
    } else {
        false
    };
    ConfigSource {
        path: path.to_path_buf(),
        loaded,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kiln.toml");
        fs::write(&path, "name = \"blog\"\n[sessions]\ntimeout_mins = 5\n").unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.app_name(), "blog");
        assert_eq!(config.sessions().timeout_mins, 5);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = TempDir::new().unwrap();
        let err = load_config_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_layers_merge_app_over_user() {
        let user = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();
        fs::write(
            user.path().join("config.toml"),
            "name = \"user\"\n[evaluators]\nmax_threads = 4\n",
        )
        .unwrap();
        fs::write(app.path().join("kiln.toml"), "name = \"app\"\n").unwrap();

        let loaded = load_config_with_options(Some(app.path()), Some(user.path())).unwrap();
        assert_eq!(loaded.config.app_name(), "app");
        assert_eq!(loaded.config.evaluators().max_threads, 4);
        assert_eq!(loaded.loaded_from().len(), 2);
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_bad_layer_becomes_warning() {
        let user = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();
        fs::write(app.path().join("kiln.toml"), "name = [unclosed").unwrap();

        let loaded = load_config_with_options(Some(app.path()), Some(user.path())).unwrap();
        assert!(loaded.loaded_from().is_empty());
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].starts_with("Failed to load"));
    }
}
