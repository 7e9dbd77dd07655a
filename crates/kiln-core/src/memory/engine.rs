//! Function-table scripting engine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use kiln_types::{ObjectRef, ParamMap, TransientNode, Value};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value as Json, json};
use tracing::debug;

use super::functions::{FunctionHandle, FunctionTable, ScriptFn};
use crate::app::AppContext;
use crate::engine::{ArgsWrap, EngineFactory, FunctionRef, ScriptingEngine};
use crate::error::ScriptError;
use crate::exchange::Exchange;
use crate::prototype::PrototypeRegistry;

/// Creates [`MemoryEngine`]s sharing one function table.
///
/// Every engine created is kept so tests can inspect them afterwards.
pub struct MemoryEngineFactory {
    functions: Arc<RwLock<FunctionTable>>,
    init_failure: Option<String>,
    engines: Mutex<Vec<Arc<MemoryEngine>>>,
}

impl MemoryEngineFactory {
    pub fn new(functions: FunctionTable) -> Self {
        Self {
            functions: Arc::new(RwLock::new(functions)),
            init_failure: None,
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Engines from this factory fail to initialize with `message`.
    pub fn with_init_failure(mut self, message: impl Into<String>) -> Self {
        self.init_failure = Some(message.into());
        self
    }

    /// The shared table. Changes are visible to all engines immediately.
    pub fn functions(&self) -> Arc<RwLock<FunctionTable>> {
        Arc::clone(&self.functions)
    }

    pub fn engines(&self) -> Vec<Arc<MemoryEngine>> {
        self.engines.lock().clone()
    }

    /// Times any engine saw a second thread enter while another was inside.
    pub fn total_overlaps(&self) -> usize {
        self.engines.lock().iter().map(|e| e.overlaps()).sum()
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn create(&self) -> Arc<dyn ScriptingEngine> {
        let engine = Arc::new(MemoryEngine {
            functions: Arc::clone(&self.functions),
            init_failure: self.init_failure.clone(),
            prototypes: OnceLock::new(),
            unit_id: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            owner: Mutex::new(None),
            overlaps: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });
        self.engines.lock().push(Arc::clone(&engine));
        engine
    }
}

/// Scripting engine backed by native closures.
///
/// Objects are [`TransientNode`]s; a node with a prototype is typed and
/// finds functions along its prototype chain. Parameter maps and other
/// values are untyped and have no functions.
pub struct MemoryEngine {
    functions: Arc<RwLock<FunctionTable>>,
    init_failure: Option<String>,
    prototypes: OnceLock<PrototypeRegistry>,
    unit_id: AtomicUsize,
    aborted: AtomicBool,
    /// Thread currently inside `invoke`, with its nesting depth.
    owner: Mutex<Option<(ThreadId, usize)>>,
    overlaps: AtomicUsize,
    calls: Mutex<Vec<String>>,
    resources: Mutex<Vec<String>>,
    shut_down: AtomicBool,
}

struct Entered<'a> {
    engine: &'a MemoryEngine,
    thread: ThreadId,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        let mut owner = self.engine.owner.lock();
        if let Some((thread, depth)) = owner.as_mut()
            && *thread == self.thread
        {
            *depth -= 1;
            if *depth == 0 {
                *owner = None;
            }
        }
    }
}

impl MemoryEngine {
    pub fn unit_id(&self) -> usize {
        self.unit_id.load(Ordering::SeqCst)
    }

    /// Names of all functions invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn injected_resources(&self) -> Vec<String> {
        self.resources.lock().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Entered<'_> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        match owner.as_mut() {
            Some((thread, depth)) if *thread == me => *depth += 1,
            Some(_) => {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            None => *owner = Some((me, 1)),
        }
        Entered {
            engine: self,
            thread: me,
        }
    }

    fn prototype_chain(&self, value: &Value) -> Option<Vec<String>> {
        let proto = prototype_of(value)?;
        Some(match self.prototypes.get() {
            Some(registry) => registry.chain(&proto),
            None => vec![proto.to_lowercase()],
        })
    }

    fn lookup(&self, this: Option<&Value>, name: &str) -> Option<ScriptFn> {
        let functions = self.functions.read();
        match this {
            None => functions.global(name),
            Some(value) => {
                let chain = self.prototype_chain(value)?;
                functions.on_chain(&chain, name)
            }
        }
    }
}

fn prototype_of(value: &Value) -> Option<String> {
    value
        .as_object()?
        .downcast_ref::<TransientNode>()?
        .prototype()
        .map(str::to_string)
}

impl ScriptingEngine for MemoryEngine {
    fn init(&self, app: &Arc<AppContext>, unit_id: usize) -> Result<(), ScriptError> {
        if let Some(message) = &self.init_failure {
            return Err(ScriptError::EngineInit(message.clone()));
        }
        self.unit_id.store(unit_id, Ordering::SeqCst);
        let _ = self.prototypes.set(app.prototypes().clone());
        Ok(())
    }

    fn enter_context(&self) -> Result<(), ScriptError> {
        self.aborted.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn exit_context(&self) -> Result<(), ScriptError> {
        Ok(())
    }

    fn invoke(
        &self,
        cx: &mut Exchange,
        this: Option<&Value>,
        function: &FunctionRef,
        args: &mut [Value],
        _wrap: ArgsWrap,
        _internal: bool,
    ) -> Result<Value, ScriptError> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(ScriptError::runtime("Script execution was aborted"));
        }
        let (name, f) = match function {
            FunctionRef::Name(name) => {
                let f = self
                    .lookup(this, name)
                    .ok_or_else(|| ScriptError::NotFound(format!("Function {name} not defined")))?;
                (name.clone(), f)
            }
            FunctionRef::Handle(handle) => {
                let handle = handle
                    .downcast_ref::<FunctionHandle>()
                    .ok_or_else(|| ScriptError::runtime(format!("{} is not a function", handle.label())))?;
                (handle.name().to_string(), handle.function())
            }
        };

        let _entered = self.enter();
        self.calls.lock().push(name);
        f(cx, this, args)
    }

    fn has_function(&self, this: Option<&Value>, name: &str, _include_inherited: bool) -> bool {
        self.lookup(this, name).is_some()
    }

    fn has_property(&self, this: Option<&Value>, name: &str) -> bool {
        self.get_property(this, name).is_some()
    }

    fn get_property(&self, this: Option<&Value>, name: &str) -> Option<Value> {
        match this {
            None => self.functions.read().global_property(name),
            Some(Value::Map(map)) => map.get(name).cloned(),
            Some(Value::Object(object)) => {
                let node = object.downcast_ref::<TransientNode>()?;
                node.get(name)
                    .or_else(|| node.child(name).map(Value::Object))
            }
            Some(_) => None,
        }
    }

    fn is_typed_object(&self, value: &Value) -> bool {
        prototype_of(value).is_some()
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        debug!(unit = self.unit_id(), "Memory engine shut down");
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, ScriptError> {
        serde_json::to_vec(&to_json(value))
            .map_err(|e| ScriptError::runtime(format!("Serialization failed: {e}")))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, ScriptError> {
        let json: Json = serde_json::from_slice(bytes)
            .map_err(|e| ScriptError::runtime(format!("Deserialization failed: {e}")))?;
        Ok(from_json(&json))
    }

    fn inject_code_resource(&self, name: &str, _source: &str) {
        self.resources.lock().push(name.to_string());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serialization
// ─────────────────────────────────────────────────────────────────────────────

const NODE_KEY: &str = "$node";

fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::List(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(map) => Json::Object(map.iter().map(|(k, v)| (k.clone(), to_json(v))).collect()),
        Value::Object(object) => match object.downcast_ref::<TransientNode>() {
            Some(node) => {
                let properties: Map<String, Json> = node
                    .properties()
                    .iter()
                    .map(|(k, v)| (k.clone(), to_json(v)))
                    .collect();
                let mut wrapper = Map::new();
                wrapper.insert(
                    NODE_KEY.to_string(),
                    json!({
                        "name": node.name(),
                        "prototype": node.prototype(),
                        "properties": properties,
                    }),
                );
                Json::Object(wrapper)
            }
            None => json!(object.label()),
        },
    }
}

fn from_json(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(items.iter().map(from_json).collect()),
        Json::Object(map) => match map.get(NODE_KEY) {
            Some(node) => Value::Object(node_from_json(node)),
            None => Value::Map(map.iter().map(|(k, v)| (k.clone(), from_json(v))).collect::<ParamMap>()),
        },
    }
}

fn node_from_json(json: &Json) -> ObjectRef {
    let name = json.get("name").and_then(Json::as_str).unwrap_or("node");
    let mut node = TransientNode::new(name);
    if let Some(proto) = json.get("prototype").and_then(Json::as_str) {
        node = node.with_prototype(proto);
    }
    if let Some(Json::Object(properties)) = json.get("properties") {
        for (key, value) in properties {
            node = node.with_property(key.clone(), from_json(value));
        }
    }
    node.into_ref()
}
