//! Native functions standing in for script code.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kiln_types::{HostObject, ObjectRef, Value};

use crate::error::ScriptError;
use crate::exchange::Exchange;

/// A script function: receives the exchange, `this` and the arguments.
pub type ScriptFn =
    Arc<dyn Fn(&mut Exchange, Option<&Value>, &mut [Value]) -> Result<Value, ScriptError> + Send + Sync>;

/// Global functions, per-prototype functions and global properties.
#[derive(Clone, Default)]
pub struct FunctionTable {
    globals: HashMap<String, ScriptFn>,
    prototypes: HashMap<String, HashMap<String, ScriptFn>>,
    properties: HashMap<String, Value>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_global<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&mut Exchange, Option<&Value>, &mut [Value]) -> Result<Value, ScriptError>
            + Send
            + Sync
            + 'static,
    {
        self.globals.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Define a function on a prototype. Prototype names are case-insensitive.
    pub fn define<F>(&mut self, prototype: &str, name: &str, f: F) -> &mut Self
    where
        F: Fn(&mut Exchange, Option<&Value>, &mut [Value]) -> Result<Value, ScriptError>
            + Send
            + Sync
            + 'static,
    {
        self.prototypes
            .entry(prototype.to_lowercase())
            .or_default()
            .insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn set_global_property(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn remove(&mut self, prototype: Option<&str>, name: &str) -> bool {
        match prototype {
            None => self.globals.remove(name).is_some(),
            Some(proto) => self
                .prototypes
                .get_mut(&proto.to_lowercase())
                .is_some_and(|functions| functions.remove(name).is_some()),
        }
    }

    pub(crate) fn global(&self, name: &str) -> Option<ScriptFn> {
        self.globals.get(name).cloned()
    }

    /// Look a function up along a prototype chain, nearest first.
    pub(crate) fn on_chain(&self, chain: &[String], name: &str) -> Option<ScriptFn> {
        chain
            .iter()
            .filter_map(|proto| self.prototypes.get(proto))
            .find_map(|functions| functions.get(name).cloned())
    }

    pub(crate) fn global_property(&self, name: &str) -> Option<Value> {
        self.properties.get(name).cloned()
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut globals: Vec<_> = self.globals.keys().collect();
        globals.sort();
        f.debug_struct("FunctionTable")
            .field("globals", &globals)
            .field("prototypes", &self.prototypes.len())
            .finish_non_exhaustive()
    }
}

/// A function passed around as a value, for invocation by handle.
pub struct FunctionHandle {
    name: String,
    function: ScriptFn,
}

impl FunctionHandle {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange, Option<&Value>, &mut [Value]) -> Result<Value, ScriptError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            function: Arc::new(f),
        }
    }

    pub fn into_ref(self) -> ObjectRef {
        ObjectRef::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn function(&self) -> ScriptFn {
        Arc::clone(&self.function)
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl HostObject for FunctionHandle {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn label(&self) -> String {
        format!("[function {}]", self.name)
    }
}
