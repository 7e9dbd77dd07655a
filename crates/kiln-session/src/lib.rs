//! Session registry with TTL expiry.
//!
//! This crate provides the per-visitor state that outlives a single request:
//! - [`Session`]: login handle, transient cache node, and user messages that
//!   survive a redirect
//! - [`SessionManager`]: create/lookup/touch/discard plus expiry sweeps that
//!   hand expired sessions back so the caller can run logout hooks
//! - [`SessionRecord`]: a serializable snapshot for saving sessions across restarts
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_session::SessionManager;
//!
//! let sessions = SessionManager::new();
//! let session = sessions.get_or_create("abc123");
//! session.login_as("admin", user_object);
//! let expired = sessions.drain_expired(Duration::from_secs(30 * 60));
//! ```

mod error;
mod manager;
mod persistence;
mod session;
mod ttl;

pub use error::{Result, SessionError};
pub use manager::SessionManager;
pub use persistence::{SessionRecord, load_records, save_records};
pub use session::{PendingMessages, Session};
pub use ttl::TtlTracker;
