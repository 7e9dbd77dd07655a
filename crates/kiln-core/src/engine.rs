//! Collaborator interfaces.
//!
//! The core never runs application code or touches storage itself. It drives
//! a [`ScriptingEngine`] per evaluator unit, a [`TransactionManager`] for
//! commit/abort, and an [`ObjectGraph`] for path navigation. The in-memory
//! implementations in [`crate::memory`] are used by tests and the CLI.

use std::sync::Arc;

use kiln_types::{ObjectRef, Value};

use crate::app::AppContext;
use crate::error::ScriptError;
use crate::exchange::Exchange;

/// How invocation arguments are converted before they reach the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgsWrap {
    /// Pass arguments through untouched.
    None,
    /// Wrap host objects into script objects.
    Default,
    /// Convert XML-RPC structures into script values.
    XmlRpc,
}

/// A function to invoke: a name resolved on the target, or a handle the
/// engine produced earlier.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionRef {
    Name(String),
    Handle(ObjectRef),
}

impl FunctionRef {
    /// The function name, if this is a by-name reference.
    pub fn name(&self) -> Option<&str> {
        match self {
            FunctionRef::Name(name) => Some(name),
            FunctionRef::Handle(_) => None,
        }
    }
}

impl From<&str> for FunctionRef {
    fn from(name: &str) -> Self {
        FunctionRef::Name(name.to_string())
    }
}

impl From<String> for FunctionRef {
    fn from(name: String) -> Self {
        FunctionRef::Name(name)
    }
}

/// An embedded scripting runtime bound to exactly one evaluator unit.
///
/// The unit guarantees that at most one thread calls into an engine at a
/// time, so implementations need interior mutability but no fairness.
pub trait ScriptingEngine: Send + Sync {
    /// Called once, on first use by the owning unit.
    fn init(&self, app: &Arc<AppContext>, unit_id: usize) -> Result<(), ScriptError>;

    /// Enter an execution context before each request pass.
    fn enter_context(&self) -> Result<(), ScriptError>;

    /// Leave the execution context. Failures here are ignored by the caller.
    fn exit_context(&self) -> Result<(), ScriptError>;

    /// Invoke `function` on `this` (the global scope when `None`).
    ///
    /// `args` is mutable so callers can observe changes the script made to
    /// an argument map.
    fn invoke(
        &self,
        cx: &mut Exchange,
        this: Option<&Value>,
        function: &FunctionRef,
        args: &mut [Value],
        wrap: ArgsWrap,
        internal: bool,
    ) -> Result<Value, ScriptError>;

    /// Whether `this` defines `name`. Engines that always search the
    /// prototype chain may ignore `include_inherited`.
    fn has_function(&self, this: Option<&Value>, name: &str, include_inherited: bool) -> bool;

    fn has_property(&self, this: Option<&Value>, name: &str) -> bool;

    fn get_property(&self, this: Option<&Value>, name: &str) -> Option<Value>;

    /// Whether the value is an instance of a declared prototype.
    fn is_typed_object(&self, value: &Value) -> bool;

    /// String conversion used when macro results are written out.
    fn to_display_string(&self, value: &Value) -> String {
        value.to_string()
    }

    /// Ask a running invocation to stop as soon as possible.
    fn abort(&self);

    /// Release everything; the engine is not used again.
    fn shutdown(&self);

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, ScriptError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, ScriptError>;

    /// Hot-reload hook: make new or changed code visible to this engine.
    fn inject_code_resource(&self, name: &str, source: &str);
}

/// Creates one engine per evaluator unit.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Arc<dyn ScriptingEngine>;
}

/// One unit of persistence work.
pub trait Transaction: Send + Sync {
    fn name(&self) -> &str;

    fn commit(&self) -> Result<(), ScriptError>;

    fn abort(&self);

    /// Forcibly terminate, from a thread other than the one running it.
    fn kill(&self);

    fn close_connections(&self);

    fn is_active(&self) -> bool;
}

pub trait TransactionManager: Send + Sync {
    fn begin(&self, name: &str) -> Arc<dyn Transaction>;
}

/// Navigation over the application's object graph.
pub trait ObjectGraph: Send + Sync {
    fn data_root(&self) -> Value;

    fn child_element(&self, parent: &Value, name: &str) -> Option<Value>;

    fn parent_element(&self, object: &Value) -> Option<Value>;

    fn prototype_name(&self, object: &Value) -> Option<String>;
}
