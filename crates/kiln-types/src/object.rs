//! Opaque handles to host objects.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// An object living in the host environment (data node, script object, ...).
///
/// The core never looks inside a host object; it only passes handles around
/// and asks the collaborators about them.
pub trait HostObject: Any + Send + Sync + fmt::Debug {
    /// Upcast for downcasting by collaborators that know the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Short human-readable label, used when an object is rendered as text.
    fn label(&self) -> String {
        "[object]".to_string()
    }
}

/// Shared handle to a [`HostObject`]. Equality is identity.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn HostObject>);

impl ObjectRef {
    /// Wrap a host object in a new handle.
    pub fn new<T: HostObject>(object: T) -> Self {
        Self(Arc::new(object))
    }

    /// Wrap an already shared host object.
    pub fn from_arc(object: Arc<dyn HostObject>) -> Self {
        Self(object)
    }

    /// Try to view the object as a concrete type.
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }

    /// Stable identity of the object while it is alive.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Create a non-owning handle.
    pub fn downgrade(&self) -> WeakObjectRef {
        WeakObjectRef(Arc::downgrade(&self.0))
    }

    /// Label of the underlying object.
    pub fn label(&self) -> String {
        self.0.label()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Non-owning counterpart of [`ObjectRef`], used for parent links.
#[derive(Clone)]
pub struct WeakObjectRef(Weak<dyn HostObject>);

impl WeakObjectRef {
    /// Upgrade to a strong handle if the object is still alive.
    pub fn upgrade(&self) -> Option<ObjectRef> {
        self.0.upgrade().map(ObjectRef)
    }
}

impl fmt::Debug for WeakObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(weak)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Marker(u32);

    impl HostObject for Marker {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_identity_equality() {
        let a = ObjectRef::new(Marker(1));
        let b = a.clone();
        let c = ObjectRef::new(Marker(1));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_downcast() {
        let a = ObjectRef::new(Marker(7));
        assert_eq!(a.downcast_ref::<Marker>().map(|m| m.0), Some(7));
    }

    #[test]
    fn test_weak_handle_expires() {
        let a = ObjectRef::new(Marker(1));
        let weak = a.downgrade();
        assert!(weak.upgrade().is_some());
        drop(a);
        assert!(weak.upgrade().is_none());
    }
}
