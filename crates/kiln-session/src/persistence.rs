//! Saving sessions across restarts.
//!
//! Only the session id, the logged-in user name and an opaque blob are
//! stored. The blob is whatever the scripting engine produced when asked to
//! serialize the session's cache node; this crate never looks inside it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SessionError};

/// Serializable snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Engine-serialized cache node.
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Write records to `path` as JSON.
pub fn save_records(path: &Path, records: &[SessionRecord]) -> Result<()> {
    let json = serde_json::to_vec_pretty(records)?;
    fs::write(path, json).map_err(|source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), count = records.len(), "Saved sessions");
    Ok(())
}

/// Read records written by [`save_records`]. A missing file yields no records.
pub fn load_records(path: &Path) -> Result<Vec<SessionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).map_err(|source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}
