//! TTL tracking for session expiration.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks last access times for TTL-based expiration.
///
/// The TTL is passed per sweep rather than stored, so a config reload takes
/// effect on the next sweep.
#[derive(Debug, Default)]
pub struct TtlTracker {
    access_times: HashMap<String, Instant>,
}

impl TtlTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access for a session (resets its TTL timer).
    pub fn touch(&mut self, session_id: &str) {
        self.touch_at(session_id, Instant::now());
    }

    /// Record an access at a given instant.
    pub fn touch_at(&mut self, session_id: &str, at: Instant) {
        self.access_times.insert(session_id.to_string(), at);
    }

    /// Last recorded access.
    pub fn last_access(&self, session_id: &str) -> Option<Instant> {
        self.access_times.get(session_id).copied()
    }

    /// Check if a session has been idle longer than `ttl`.
    pub fn is_expired(&self, session_id: &str, ttl: Duration) -> bool {
        match self.access_times.get(session_id) {
            None => true,
            Some(last_access) => last_access.elapsed() > ttl,
        }
    }

    /// Remove tracking for a session.
    pub fn remove(&mut self, session_id: &str) {
        self.access_times.remove(session_id);
    }

    /// Remove all entries idle longer than `ttl` and return their IDs.
    pub fn drain_expired(&mut self, ttl: Duration) -> Vec<String> {
        self.drain_expired_at(ttl, Instant::now())
    }

    /// Like [`drain_expired`](Self::drain_expired) with an explicit "now".
    pub fn drain_expired_at(&mut self, ttl: Duration, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .access_times
            .iter()
            .filter(|(_, last_access)| now.saturating_duration_since(**last_access) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.access_times.remove(id);
        }
        expired
    }

    /// Get the number of tracked sessions.
    pub fn len(&self) -> usize {
        self.access_times.len()
    }

    /// Check if there are no tracked sessions.
    pub fn is_empty(&self) -> bool {
        self.access_times.is_empty()
    }
}
