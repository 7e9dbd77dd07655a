//! A single visitor session.

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use kiln_types::{HostObject, ObjectRef, TransientNode};
use parking_lot::Mutex;

/// User-visible messages carried from one request to the next.
///
/// A request that ends in a redirect stores its pending message here; the
/// next request on the same session recovers it into its response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingMessages {
    pub message: Option<String>,
    pub debug: Option<String>,
}

impl PendingMessages {
    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.debug.is_none()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    user: Option<ObjectRef>,
    user_name: Option<String>,
    messages: PendingMessages,
}

/// Per-visitor state shared by every request carrying the same session id.
pub struct Session {
    id: String,
    cache: ObjectRef,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create a session with an empty cache node.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_cache_node(id, TransientNode::new("session").into_ref())
    }

    /// Create a session around an existing cache node (e.g. one restored from disk).
    pub fn with_cache_node(id: impl Into<String>, cache: ObjectRef) -> Self {
        Self {
            id: id.into(),
            cache,
            created_at: Utc::now(),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The transient object scripts use to stash per-session data.
    pub fn cache_node(&self) -> &ObjectRef {
        &self.cache
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Associate the session with a user object.
    pub fn login_as(&self, user_name: impl Into<String>, user: ObjectRef) {
        let mut state = self.state.lock();
        state.user_name = Some(user_name.into());
        state.user = Some(user);
    }

    /// Drop the user association, returning the previous user handle.
    pub fn logout(&self) -> Option<ObjectRef> {
        let mut state = self.state.lock();
        state.user_name = None;
        state.user.take()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().user.is_some()
    }

    pub fn user(&self) -> Option<ObjectRef> {
        self.state.lock().user.clone()
    }

    pub fn user_name(&self) -> Option<String> {
        self.state.lock().user_name.clone()
    }

    /// Keep messages for the next request. Empty messages leave the slot untouched.
    pub fn store_messages(&self, messages: PendingMessages) {
        if messages.is_empty() {
            return;
        }
        self.state.lock().messages = messages;
    }

    /// Take the stored messages, leaving none behind.
    pub fn recover_messages(&self) -> PendingMessages {
        std::mem::take(&mut self.state.lock().messages)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl HostObject for Session {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn label(&self) -> String {
        format!("[Session {}]", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_logout() {
        let session = Session::new("s1");
        assert!(!session.is_logged_in());

        let user = TransientNode::new("alice").with_prototype("User").into_ref();
        session.login_as("alice", user.clone());
        assert!(session.is_logged_in());
        assert_eq!(session.user_name().as_deref(), Some("alice"));

        assert_eq!(session.logout(), Some(user));
        assert!(!session.is_logged_in());
        assert!(session.user_name().is_none());
    }

    #[test]
    fn test_messages_are_taken_once() {
        let session = Session::new("s1");
        session.store_messages(PendingMessages {
            message: Some("Saved".to_string()),
            debug: None,
        });

        assert_eq!(session.recover_messages().message.as_deref(), Some("Saved"));
        assert!(session.recover_messages().is_empty());
    }

    #[test]
    fn test_empty_messages_do_not_clobber() {
        let session = Session::new("s1");
        session.store_messages(PendingMessages {
            message: Some("kept".to_string()),
            debug: None,
        });
        session.store_messages(PendingMessages::default());
        assert_eq!(session.recover_messages().message.as_deref(), Some("kept"));
    }

    #[test]
    fn test_cache_node_is_writable() {
        let session = Session::new("s1");
        let node = session.cache_node().downcast_ref::<TransientNode>().unwrap();
        node.set("visits", 3i64);
        assert_eq!(node.get("visits"), Some(kiln_types::Value::Int(3)));
        assert_eq!(session.label(), "[Session s1]");
    }
}
