//! In-memory property bag used for transient data objects.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;

use crate::{HostObject, ObjectRef, Value, WeakObjectRef};

/// A named node holding properties and named children.
///
/// Used wherever the core needs an object that scripts can read and write
/// without going through persistence: session cache nodes, the request and
/// response data objects, and the in-memory object graph.
pub struct TransientNode {
    name: String,
    prototype: Option<String>,
    properties: RwLock<BTreeMap<String, Value>>,
    children: RwLock<BTreeMap<String, ObjectRef>>,
    parent: RwLock<Option<WeakObjectRef>>,
}

impl TransientNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prototype: None,
            properties: RwLock::new(BTreeMap::new()),
            children: RwLock::new(BTreeMap::new()),
            parent: RwLock::new(None),
        }
    }

    /// Assign the prototype this node is an instance of.
    pub fn with_prototype(mut self, prototype: impl Into<String>) -> Self {
        self.prototype = Some(prototype.into());
        self
    }

    /// Set a property before the node is shared.
    pub fn with_property(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.write().insert(key.into(), value.into());
        self
    }

    /// Wrap the node into a shared handle.
    pub fn into_ref(self) -> ObjectRef {
        ObjectRef::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prototype(&self) -> Option<&str> {
        self.prototype.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.properties.read().get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.properties.read().contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.properties.write().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.properties.write().remove(key)
    }

    pub fn property_names(&self) -> Vec<String> {
        self.properties.read().keys().cloned().collect()
    }

    /// Snapshot of all properties.
    pub fn properties(&self) -> BTreeMap<String, Value> {
        self.properties.read().clone()
    }

    pub fn child(&self, name: &str) -> Option<ObjectRef> {
        self.children.read().get(name).cloned()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    pub fn parent(&self) -> Option<ObjectRef> {
        self.parent.read().as_ref().and_then(WeakObjectRef::upgrade)
    }

    /// Attach `child` under `parent` with the given name.
    ///
    /// Returns false if `parent` is not a transient node. The child's parent
    /// link is only set when the child is a transient node too.
    pub fn attach(parent: &ObjectRef, name: impl Into<String>, child: &ObjectRef) -> bool {
        let Some(node) = parent.downcast_ref::<TransientNode>() else {
            return false;
        };
        node.children.write().insert(name.into(), child.clone());
        if let Some(child_node) = child.downcast_ref::<TransientNode>() {
            *child_node.parent.write() = Some(parent.downgrade());
        }
        true
    }
}

impl fmt::Debug for TransientNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransientNode")
            .field("name", &self.name)
            .field("prototype", &self.prototype)
            .finish_non_exhaustive()
    }
}

impl HostObject for TransientNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn label(&self) -> String {
        format!(
            "[{} {}]",
            self.prototype.as_deref().unwrap_or("TransientNode"),
            self.name
        )
    }
}
