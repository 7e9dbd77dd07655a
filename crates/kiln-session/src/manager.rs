//! Session registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::session::Session;
use crate::ttl::TtlTracker;

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    ttl: TtlTracker,
}

/// Registry of live sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionManager {
    inner: Mutex<Registry>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a session with a fresh random id.
    pub fn create_session(&self) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.get_or_create(&id)
    }

    /// Look up a session, creating it if needed, and mark it as accessed.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        let mut inner = self.inner.lock();
        inner.ttl.touch(id);
        if let Some(session) = inner.sessions.get(id) {
            return Arc::clone(session);
        }
        debug!(session_id = %id, "Creating session");
        let session = Arc::new(Session::new(id));
        inner.sessions.insert(id.to_string(), Arc::clone(&session));
        session
    }

    /// Register an existing session object (e.g. restored from disk).
    pub fn insert(&self, session: Arc<Session>) {
        let mut inner = self.inner.lock();
        inner.ttl.touch(session.id());
        inner.sessions.insert(session.id().to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(id).cloned()
    }

    /// Like [`get`](Self::get), but a missing session is an error.
    pub fn get_existing(&self, id: &str) -> Result<Arc<Session>> {
        self.get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Mark a session as accessed. Returns false for unknown ids.
    pub fn touch(&self, id: &str) -> bool {
        self.touch_at(id, Instant::now())
    }

    pub fn touch_at(&self, id: &str, at: Instant) -> bool {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(id) {
            return false;
        }
        inner.ttl.touch_at(id, at);
        true
    }

    /// Remove a session.
    pub fn discard(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        inner.ttl.remove(id);
        inner.sessions.remove(id)
    }

    /// Remove and return every session idle longer than `ttl`.
    pub fn drain_expired(&self, ttl: Duration) -> Vec<Arc<Session>> {
        self.drain_expired_at(ttl, Instant::now())
    }

    pub fn drain_expired_at(&self, ttl: Duration, now: Instant) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock();
        let ids = inner.ttl.drain_expired_at(ttl, now);
        ids.iter()
            .filter_map(|id| inner.sessions.remove(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.lock().sessions.values().cloned().collect()
    }
}
