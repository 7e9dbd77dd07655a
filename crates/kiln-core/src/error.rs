//! Error types for the server core.

use kiln_config::ConfigError;
use kiln_session::SessionError;

/// Errors raised while running application code.
///
/// These cross the boundary between the core and the scripting engine, so
/// they are cheap to clone and carry only messages.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("{0}")]
    Runtime(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The transaction lost a race with another writer.
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// Not a failure: the response was redirected.
    #[error("Redirect to {0}")]
    Redirect(String),

    /// The response was abandoned on purpose; the transaction is rolled back.
    #[error("Request aborted")]
    Abort,

    #[error("Request timed out")]
    Timeout,

    #[error("{0}")]
    Macro(String),

    #[error("Skin recursion limit of {0} exceeded")]
    SkinRecursion(usize),

    #[error("Skin error: {0}")]
    Skin(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Scripting engine failed to initialize: {0}")]
    EngineInit(String),
}

impl ScriptError {
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime(message.into())
    }

    /// Errors that must not be turned into an inline annotation by a macro.
    pub fn escapes_macro(&self) -> bool {
        matches!(
            self,
            ScriptError::Redirect(_)
                | ScriptError::Conflict(_)
                | ScriptError::Timeout
                | ScriptError::Abort
                | ScriptError::SkinRecursion(_)
        )
    }
}

/// Error type for server core operations.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    #[error("No free evaluators for application {0}")]
    ResourceExhausted(String),

    #[error("Application {0} is not running")]
    ApplicationStopped(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Request was interrupted")]
    Interrupted,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid pool size {0}, must be between 2 and 511")]
    InvalidPoolSize(usize),

    #[error("Invalid cron job {name}: {reason}")]
    InvalidCron { name: String, reason: String },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result type for server core operations.
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_macro() {
        assert!(ScriptError::Redirect("/".into()).escapes_macro());
        assert!(ScriptError::SkinRecursion(50).escapes_macro());
        assert!(!ScriptError::Macro("Unhandled macro: x".into()).escapes_macro());
        assert!(!ScriptError::runtime("boom").escapes_macro());
    }

    #[test]
    fn test_script_error_converts() {
        let err: KilnError = ScriptError::NotFound("x".into()).into();
        assert_eq!(err.to_string(), "Not found: x");
    }
}
