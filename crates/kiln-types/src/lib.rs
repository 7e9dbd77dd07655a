//! Shared value model for the Kiln application server.
//!
//! Everything that crosses the boundary between the server core and the
//! pluggable scripting/persistence collaborators is expressed in these types:
//! - [`Value`]: the dynamic value passed as arguments and results
//! - [`ObjectRef`]: an opaque, reference-counted handle to a host object
//! - [`TransientNode`]: an in-memory property bag (session caches, request data)
//! - [`ParamMap`]: a copy-on-write map used for macro parameters
//! - [`CacheMap`]: a two-generation cache with rotation instead of per-entry LRU

mod cache_map;
mod node;
mod object;
mod param_map;
mod value;

pub use cache_map::CacheMap;
pub use node::TransientNode;
pub use object::{HostObject, ObjectRef, WeakObjectRef};
pub use param_map::ParamMap;
pub use value::Value;
