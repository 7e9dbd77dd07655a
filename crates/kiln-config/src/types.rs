//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! name = "shop"            # application name
//! [evaluators]             # pool sizing and worker idle policy
//! [requests]               # timeouts, conflict backoff, fallback actions
//! [sessions]               # session expiry
//! [scheduler]              # background tick interval
//! [skins]                  # renderer limits and global macro path
//! [logging]                # log file location
//! [prototypes]             # prototype inheritance, name = parent
//! [cron.nightly]           # one table per cron job
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Smallest pool size accepted by an explicit resize.
pub const MIN_POOL_SIZE: usize = 2;

/// Largest pool size accepted by an explicit resize.
pub const MAX_POOL_SIZE: usize = 511;

/// Application name used when none is configured.
pub const DEFAULT_APP_NAME: &str = "app";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. app-local
/// overrides) can be loaded and merged. Use the accessor methods to get a
/// section with defaults filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application name, used for thread names and log fields.
    pub name: Option<String>,

    /// Evaluator pool configuration.
    pub evaluators: Option<EvaluatorConfig>,

    /// Request handling configuration.
    pub requests: Option<RequestConfig>,

    /// Session configuration.
    pub sessions: Option<SessionConfig>,

    /// Background scheduler configuration.
    pub scheduler: Option<SchedulerConfig>,

    /// Skin renderer configuration.
    pub skins: Option<SkinConfig>,

    /// Logging configuration.
    pub logging: Option<LoggingConfig>,

    /// Prototype inheritance: prototype name to parent prototype name.
    pub prototypes: BTreeMap<String, String>,

    /// Declarative cron jobs keyed by job name.
    pub cron: BTreeMap<String, CronEntry>,
}

impl AppConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: AppConfig) {
        if other.name.is_some() {
            self.name = other.name;
        }

        if other.evaluators.is_some() {
            self.evaluators = other.evaluators;
        }

        if other.requests.is_some() {
            self.requests = other.requests;
        }

        if other.sessions.is_some() {
            self.sessions = other.sessions;
        }

        if other.scheduler.is_some() {
            self.scheduler = other.scheduler;
        }

        if other.skins.is_some() {
            self.skins = other.skins;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }

        for (name, parent) in other.prototypes {
            self.prototypes.insert(name, parent);
        }

        for (name, entry) in other.cron {
            self.cron.insert(name, entry);
        }
    }

    /// Application name, falling back to the default.
    pub fn app_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_APP_NAME)
    }

    // Section accessors fall back to a shared default when the section is
    // absent.

    pub fn evaluators(&self) -> &EvaluatorConfig {
        static DEFAULT: OnceLock<EvaluatorConfig> = OnceLock::new();
        self.evaluators.as_ref().unwrap_or_else(|| DEFAULT.get_or_init(EvaluatorConfig::default))
    }

    pub fn requests(&self) -> &RequestConfig {
        static DEFAULT: OnceLock<RequestConfig> = OnceLock::new();
        self.requests.as_ref().unwrap_or_else(|| DEFAULT.get_or_init(RequestConfig::default))
    }

    pub fn sessions(&self) -> &SessionConfig {
        static DEFAULT: OnceLock<SessionConfig> = OnceLock::new();
        self.sessions.as_ref().unwrap_or_else(|| DEFAULT.get_or_init(SessionConfig::default))
    }

    pub fn scheduler(&self) -> &SchedulerConfig {
        static DEFAULT: OnceLock<SchedulerConfig> = OnceLock::new();
        self.scheduler.as_ref().unwrap_or_else(|| DEFAULT.get_or_init(SchedulerConfig::default))
    }

    pub fn skins(&self) -> &SkinConfig {
        static DEFAULT: OnceLock<SkinConfig> = OnceLock::new();
        self.skins.as_ref().unwrap_or_else(|| DEFAULT.get_or_init(SkinConfig::default))
    }

    pub fn logging(&self) -> &LoggingConfig {
        static DEFAULT: OnceLock<LoggingConfig> = OnceLock::new();
        self.logging.as_ref().unwrap_or_else(|| DEFAULT.get_or_init(LoggingConfig::default))
    }

    /// Check settings that would make the server misbehave.
    pub fn validate(&self) -> Result<()> {
        let evaluators = self.evaluators();
        if evaluators.max_threads == 0 || evaluators.max_threads > MAX_POOL_SIZE {
            return Err(invalid(
                "evaluators.max_threads",
                format!("must be between 1 and {MAX_POOL_SIZE}"),
            ));
        }
        if evaluators.min_threads > evaluators.max_threads {
            return Err(invalid(
                "evaluators.min_threads",
                "must not exceed evaluators.max_threads",
            ));
        }
        if evaluators.acquire_attempts == 0 {
            return Err(invalid("evaluators.acquire_attempts", "must be at least 1"));
        }

        let skins = self.skins();
        if skins.max_depth == 0 {
            return Err(invalid("skins.max_depth", "must be at least 1"));
        }

        for (name, parent) in &self.prototypes {
            if name.eq_ignore_ascii_case(parent) {
                return Err(invalid(
                    format!("prototypes.{name}"),
                    "a prototype cannot extend itself",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluator Pool Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluator pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Units allocated when the application starts.
    pub min_threads: usize,
    /// Upper bound on pool membership.
    pub max_threads: usize,
    /// How many times a caller re-checks a full pool before giving up.
    pub acquire_attempts: u32,
    /// Wait between re-checks of a full pool, in milliseconds.
    pub acquire_retry_interval_ms: u64,
    /// How long an idle unit keeps its thread waiting for work, in milliseconds.
    pub idle_timeout_ms: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: 50,
            acquire_attempts: 4,
            acquire_retry_interval_ms: 3000,
            idle_timeout_ms: 10 * 60 * 1000,
        }
    }
}

impl EvaluatorConfig {
    pub fn acquire_retry_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Request handling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// How long HTTP and RPC callers wait for a unit, in milliseconds.
    pub timeout_ms: u64,
    /// Default wait for internal invocations, in milliseconds.
    pub internal_timeout_ms: u64,
    /// Base of the randomized backoff after a transaction conflict, in milliseconds.
    pub conflict_backoff_ms: u64,
    /// Action rendered after an application error.
    pub error_action: String,
    /// Action rendered when a path cannot be resolved.
    pub notfound_action: String,
    /// RPC functions callable from outside, as `prototype.function`.
    pub xmlrpc_access: Vec<String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            internal_timeout_ms: 15 * 60 * 1000,
            conflict_backoff_ms: 800,
            error_action: "error".to_string(),
            notfound_action: "notfound".to_string(),
            xmlrpc_access: Vec::new(),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn internal_timeout(&self) -> Duration {
        Duration::from_millis(self.internal_timeout_ms)
    }

    /// Whether `prototype.function` is on the RPC allow-list (case-insensitive).
    pub fn allows_rpc(&self, prototype: &str, function: &str) -> bool {
        let key = format!("{prototype}.{function}");
        self.xmlrpc_access
            .iter()
            .flat_map(|entry| entry.split([',', ';', ' ']))
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(&key))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minutes of inactivity after which a session is discarded.
    pub timeout_mins: u64,
    /// Minimum seconds between two session sweeps.
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_mins: 30,
            cleanup_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_mins * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Background scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether the scheduler thread is started with the application.
    pub enabled: bool,
    /// Fixed tick interval in seconds. Unset aligns ticks to the wall-clock minute.
    pub interval_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Skin Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Skin renderer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkinConfig {
    /// Maximum nesting of skin renders before rendering fails.
    pub max_depth: usize,
    /// Prefixes searched for global macros, first match wins.
    pub global_macro_path: Vec<String>,
    /// Charset used for URL encoding of macro output.
    pub charset: String,
    /// Number of parsed skins kept in memory.
    pub cache_size: usize,
}

impl Default for SkinConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            global_macro_path: Vec::new(),
            charset: "UTF-8".to_string(),
            cache_size: 200,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log file.
    pub directory: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Cron Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// One `[cron.<name>]` table.
///
/// Calendar fields accept `*`, single values, lists and `a-b` ranges;
/// month and weekday also accept names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronEntry {
    /// Global function to invoke.
    pub function: Option<String>,
    pub year: Option<CronField>,
    pub month: Option<CronField>,
    pub day: Option<CronField>,
    pub weekday: Option<CronField>,
    pub hour: Option<CronField>,
    pub minute: Option<CronField>,
    /// Timeout in seconds.
    pub timeout: Option<u64>,
}

/// A calendar field given either as a bare number or as an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CronField {
    Number(u32),
    Expr(String),
}

impl CronField {
    /// The field as an expression string.
    pub fn expr(&self) -> String {
        match self {
            CronField::Number(n) => n.to_string(),
            CronField::Expr(s) => s.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::new();
        assert_eq!(config.app_name(), DEFAULT_APP_NAME);
        assert_eq!(config.evaluators().max_threads, 50);
        assert_eq!(config.requests().timeout(), Duration::from_secs(60));
        assert_eq!(config.requests().error_action, "error");
        assert_eq!(config.sessions().timeout(), Duration::from_secs(30 * 60));
        assert_eq!(config.skins().max_depth, 50);
        assert!(config.scheduler().enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full() {
        let toml = r#"
name = "shop"

[evaluators]
min_threads = 2
max_threads = 8

[requests]
timeout_ms = 5000
xmlrpc_access = ["Root.ping", "Page.title"]

[prototypes]
Page = "HopObject"
Article = "Page"

[cron.nightly]
function = "cleanup"
hour = 3
minute = "0-5,30"
timeout = 60
"#;
        let config = AppConfig::from_toml(toml).unwrap();
        assert_eq!(config.app_name(), "shop");
        assert_eq!(config.evaluators().min_threads, 2);
        // unspecified fields in a present section fall back to defaults
        assert_eq!(config.evaluators().acquire_attempts, 4);
        assert_eq!(config.prototypes.get("Article").map(String::as_str), Some("Page"));

        let nightly = &config.cron["nightly"];
        assert_eq!(nightly.function.as_deref(), Some("cleanup"));
        assert_eq!(nightly.hour, Some(CronField::Number(3)));
        assert_eq!(nightly.minute.as_ref().map(CronField::expr).as_deref(), Some("0-5,30"));
        assert_eq!(nightly.timeout, Some(60));
    }

    #[test]
    fn test_merge_overrides_sections() {
        let mut base = AppConfig::from_toml(
            r#"
name = "base"
[evaluators]
max_threads = 10
[cron.a]
function = "a"
"#,
        )
        .unwrap();
        let overlay = AppConfig::from_toml(
            r#"
[evaluators]
max_threads = 20
[cron.b]
function = "b"
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.app_name(), "base");
        assert_eq!(base.evaluators().max_threads, 20);
        assert_eq!(base.cron.len(), 2);
    }

    #[test]
    fn test_allows_rpc_case_insensitive() {
        let requests = RequestConfig {
            xmlrpc_access: vec!["Root.ping, page.Title".to_string()],
            ..Default::default()
        };
        assert!(requests.allows_rpc("root", "PING"));
        assert!(requests.allows_rpc("Page", "title"));
        assert!(!requests.allows_rpc("Root", "delete"));
    }

    #[test]
    fn test_validate_rejects_bad_pool() {
        let config = AppConfig::from_toml(
            r#"
[evaluators]
min_threads = 9
max_threads = 4
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "evaluators.min_threads"
        ));
    }

    #[test]
    fn test_section_accessors_borrow_without_copying() {
        let config = AppConfig::from_toml("[skins]\nglobal_macro_path = [\"lib\", \"\"]\n").unwrap();
        let skins = config.skins();
        assert!(std::ptr::eq(skins, config.skins.as_ref().unwrap()));
        assert_eq!(skins.global_macro_path, vec!["lib".to_string(), String::new()]);

        // absent sections share one default
        let empty = AppConfig::default();
        let other = AppConfig::default();
        assert!(std::ptr::eq(empty.requests(), other.requests()));
        assert_eq!(empty.requests().error_action, "error");
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = AppConfig::from_toml("name = \"x\"\n[skins]\nmax_depth = 7\n").unwrap();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.skins().max_depth, 7);
    }
}
