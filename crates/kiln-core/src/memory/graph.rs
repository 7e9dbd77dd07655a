//! Object graph over transient nodes.

use kiln_types::{ObjectRef, TransientNode, Value};

use crate::engine::ObjectGraph;

/// Prototype given to the root node by [`MemoryGraph::with_root`].
pub const ROOT_NODE_PROTOTYPE: &str = "Root";

/// An object graph whose nodes are [`TransientNode`]s linked by
/// [`TransientNode::attach`].
#[derive(Debug, Clone)]
pub struct MemoryGraph {
    root: ObjectRef,
}

impl MemoryGraph {
    pub fn new(root: ObjectRef) -> Self {
        Self { root }
    }

    /// A graph with an empty root node of prototype `Root`.
    pub fn with_root() -> Self {
        Self::new(
            TransientNode::new("root")
                .with_prototype(ROOT_NODE_PROTOTYPE)
                .into_ref(),
        )
    }

    pub fn root(&self) -> &ObjectRef {
        &self.root
    }

    /// Create a node under `parent` and return it.
    pub fn add_child(&self, parent: &ObjectRef, name: &str, prototype: Option<&str>) -> ObjectRef {
        let mut node = TransientNode::new(name);
        if let Some(prototype) = prototype {
            node = node.with_prototype(prototype);
        }
        let child = node.into_ref();
        TransientNode::attach(parent, name, &child);
        child
    }
}

fn node(value: &Value) -> Option<&TransientNode> {
    value.as_object()?.downcast_ref::<TransientNode>()
}

impl ObjectGraph for MemoryGraph {
    fn data_root(&self) -> Value {
        Value::Object(self.root.clone())
    }

    fn child_element(&self, parent: &Value, name: &str) -> Option<Value> {
        node(parent)?.child(name).map(Value::Object)
    }

    fn parent_element(&self, object: &Value) -> Option<Value> {
        node(object)?.parent().map(Value::Object)
    }

    fn prototype_name(&self, object: &Value) -> Option<String> {
        node(object)?.prototype().map(str::to_string)
    }
}
