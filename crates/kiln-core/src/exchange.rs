//! Per-request state.
//!
//! An [`Exchange`] is created by an evaluator unit for each unit of work and
//! passed explicitly to every piece of code that needs "the current request":
//! the path resolver, the skin renderer, and the scripting engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_session::{PendingMessages, Session};
use kiln_types::{ObjectRef, ParamMap, TransientNode, Value};

use crate::app::AppContext;
use crate::engine::{ArgsWrap, FunctionRef, ScriptingEngine};
use crate::error::ScriptError;
use crate::skin::{self, Skin};

/// Pseudo method assigned once a request is dispatched to an XML-RPC action.
pub const XMLRPC_METHOD: &str = "XMLRPC";

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded XML-RPC call carried by an HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub method: String,
    pub params: Vec<Value>,
}

/// Identity of a request for deduplication of simultaneous identical requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    method: String,
    path: String,
    session: String,
    params: Vec<(String, String)>,
    if_modified_since: Option<i64>,
    etags: Vec<String>,
}

/// An incoming request.
#[derive(Debug, Clone)]
pub struct RequestTrans {
    method: String,
    path: String,
    session_id: Option<String>,
    params: ParamMap,
    if_modified_since: Option<i64>,
    etags: Vec<String>,
    rpc: Option<RpcCall>,
    action: Option<String>,
    data: ObjectRef,
}

impl RequestTrans {
    pub fn new(method: &str, path: impl Into<String>) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.into(),
            session_id: None,
            params: ParamMap::new(),
            if_modified_since: None,
            etags: Vec::new(),
            rpc: None,
            action: None,
            data: TransientNode::new("request").into_ref(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Add a request parameter. Parameters are also readable as properties
    /// of the request data object.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        if let Some(node) = self.data.downcast_ref::<TransientNode>() {
            node.set(key.clone(), value.clone());
        }
        self.params.insert(key, value);
        self
    }

    pub fn with_if_modified_since(mut self, millis: i64) -> Self {
        self.if_modified_since = Some(millis);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etags.push(etag.into());
        self
    }

    /// Attach a decoded XML-RPC call body.
    pub fn with_rpc(mut self, method: impl Into<String>, params: Vec<Value>) -> Self {
        self.rpc = Some(RpcCall {
            method: method.into(),
            params,
        });
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn set_method(&mut self, method: &str) {
        self.method = method.to_uppercase();
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) fn set_session_id(&mut self, id: &str) {
        self.session_id = Some(id.to_string());
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn rpc(&self) -> Option<&RpcCall> {
        self.rpc.as_ref()
    }

    /// Whether the request body may be an XML-RPC call.
    pub fn check_xmlrpc(&self) -> bool {
        self.rpc.is_some()
    }

    /// Whether the request was dispatched to an XML-RPC action.
    pub fn is_xmlrpc(&self) -> bool {
        self.method == XMLRPC_METHOD
    }

    /// Name of the resolved action, without the `_action` suffix.
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn set_action(&mut self, function: &str) {
        let action = match function.find("_action") {
            Some(idx) => &function[..idx],
            None => function,
        };
        self.action = Some(action.to_string());
    }

    /// The object scripts see as `request`.
    pub fn data(&self) -> &ObjectRef {
        &self.data
    }

    /// Deduplication key. Requests without a session are never deduplicated.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        let session = self.session_id.clone()?;
        Some(Fingerprint {
            method: self.method.clone(),
            path: self.path.to_lowercase(),
            session,
            params: self
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            if_modified_since: self.if_modified_since,
            etags: self.etags.clone(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────────────────────────────────────

/// Result of an XML-RPC action.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    Result(Value),
    Fault(String),
}

/// Finished response handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub redirect: Option<String>,
    pub message: Option<String>,
    pub rpc: Option<RpcOutcome>,
}

/// The response being built while a request runs.
#[derive(Debug)]
pub struct ResponseTrans {
    buffers: Vec<String>,
    status: u16,
    content_type: Option<String>,
    message: Option<String>,
    error: Option<String>,
    debug: Option<String>,
    redirect: Option<String>,
    rpc: Option<RpcOutcome>,
    data: ObjectRef,
}

impl Default for ResponseTrans {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTrans {
    pub fn new() -> Self {
        Self {
            buffers: vec![String::new()],
            status: 200,
            content_type: None,
            message: None,
            error: None,
            debug: None,
            redirect: None,
            rpc: None,
            data: TransientNode::new("response").into_ref(),
        }
    }

    /// Append to the current buffer.
    pub fn write(&mut self, text: &str) {
        self.current_mut().push_str(text);
    }

    /// Start collecting output into a fresh buffer.
    pub fn push_buffer(&mut self) {
        self.buffers.push(String::new());
    }

    /// Remove the current buffer and return its contents. The base buffer is
    /// emptied rather than removed.
    pub fn pop_string(&mut self) -> String {
        if self.buffers.len() > 1 {
            self.buffers.pop().unwrap_or_default()
        } else {
            std::mem::take(self.current_mut())
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffers.last().map_or(0, String::len)
    }

    /// Cut the current buffer at `pos`, returning what followed.
    pub fn split_off(&mut self, pos: usize) -> String {
        let current = self.current_mut();
        if pos >= current.len() {
            return String::new();
        }
        current.split_off(pos)
    }

    pub fn insert_at(&mut self, pos: usize, text: &str) {
        let current = self.current_mut();
        let pos = pos.min(current.len());
        current.insert_str(pos, text);
    }

    fn current_mut(&mut self) -> &mut String {
        if self.buffers.is_empty() {
            self.buffers.push(String::new());
        }
        let last = self.buffers.len() - 1;
        &mut self.buffers[last]
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// User-visible message, kept across a redirect.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// Message of the error being handled by the error action.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn debug(&self) -> Option<&str> {
        self.debug.as_deref()
    }

    pub fn set_debug(&mut self, debug: impl Into<String>) {
        self.debug = Some(debug.into());
    }

    pub fn redirect(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    pub fn set_redirect(&mut self, url: impl Into<String>) {
        self.redirect = Some(url.into());
    }

    pub fn rpc(&self) -> Option<&RpcOutcome> {
        self.rpc.as_ref()
    }

    pub fn set_rpc_result(&mut self, value: Value) {
        self.rpc = Some(RpcOutcome::Result(value));
    }

    pub fn set_rpc_fault(&mut self, message: impl Into<String>) {
        self.rpc = Some(RpcOutcome::Fault(message.into()));
    }

    /// The object scripts see as `response`.
    pub fn data(&self) -> &ObjectRef {
        &self.data
    }

    /// Discard everything written so far.
    pub fn reset(&mut self) {
        self.buffers = vec![String::new()];
        self.status = 200;
        self.content_type = None;
        self.message = None;
        self.error = None;
        self.redirect = None;
        self.rpc = None;
    }

    /// Replace the response with a minimal error page.
    pub fn report_error(&mut self, app: &str, message: &str) {
        self.reset();
        self.status = 500;
        self.content_type = Some("text/html".to_string());
        self.write("<html><body><h3>Error in application ");
        self.write(app);
        self.write("</h3>");
        self.write(&skin::encode::html(message));
        self.write("</body></html>");
    }

    /// Bring over messages stored by a previous redirected request.
    pub fn restore_messages(&mut self, pending: PendingMessages) {
        if let Some(message) = pending.message {
            self.message = Some(message);
        }
        if let Some(debug) = pending.debug {
            self.debug = Some(debug);
        }
    }

    pub fn pending_messages(&self) -> PendingMessages {
        PendingMessages {
            message: self.message.clone(),
            debug: self.debug.clone(),
        }
    }

    pub fn snapshot(&self) -> Response {
        Response {
            status: self.status,
            content_type: self.content_type.clone(),
            body: self.buffers.concat(),
            redirect: self.redirect.clone(),
            message: self.message.clone(),
            rpc: self.rpc.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Exchange
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the caller is still waiting for this piece of work.
///
/// The unit bumps its generation whenever the caller gives up; work that
/// sees a different generation than the one it started with is orphaned.
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    current: Arc<AtomicU64>,
    generation: u64,
}

impl StopSignal {
    pub(crate) fn new(current: Arc<AtomicU64>, generation: u64) -> Self {
        Self {
            current,
            generation,
        }
    }

    pub(crate) fn detached() -> Self {
        Self::new(Arc::new(AtomicU64::new(0)), 0)
    }

    pub(crate) fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

/// Everything a running request can reach.
pub struct Exchange {
    app: Arc<AppContext>,
    engine: Arc<dyn ScriptingEngine>,
    unit_id: usize,
    stop: StopSignal,
    pub request: RequestTrans,
    pub response: ResponseTrans,
    session: Arc<Session>,
    handlers: HashMap<String, Value>,
    pub(crate) skin_depth: usize,
    pub(crate) active_skin: Option<Arc<Skin>>,
    path: Vec<Value>,
}

impl Exchange {
    pub(crate) fn new(
        app: Arc<AppContext>,
        engine: Arc<dyn ScriptingEngine>,
        unit_id: usize,
        stop: StopSignal,
        request: RequestTrans,
        session: Arc<Session>,
    ) -> Self {
        Self {
            app,
            engine,
            unit_id,
            stop,
            request,
            response: ResponseTrans::new(),
            session,
            handlers: HashMap::new(),
            skin_depth: 0,
            active_skin: None,
            path: Vec::new(),
        }
    }

    /// An exchange outside of any evaluator, for rendering skins directly.
    pub fn standalone(app: Arc<AppContext>, engine: Arc<dyn ScriptingEngine>) -> Self {
        let session = Arc::new(Session::new("standalone"));
        Self::new(
            app,
            engine,
            0,
            StopSignal::detached(),
            RequestTrans::get(""),
            session,
        )
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    pub fn engine(&self) -> &Arc<dyn ScriptingEngine> {
        &self.engine
    }

    pub fn unit_id(&self) -> usize {
        self.unit_id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// True once the caller has stopped waiting. Long-running scripts
    /// should poll this and bail out.
    pub fn is_cancelled(&self) -> bool {
        !self.stop.is_current()
    }

    pub(crate) fn is_current(&self) -> bool {
        self.stop.is_current()
    }

    pub fn write(&mut self, text: &str) {
        self.response.write(text);
    }

    /// Macro handler registered under `name` (case-insensitive).
    pub fn handler(&self, name: &str) -> Option<&Value> {
        self.handlers.get(&name.to_lowercase())
    }

    pub fn set_handler(&mut self, name: &str, handler: Value) -> Option<Value> {
        self.handlers.insert(name.to_lowercase(), handler)
    }

    pub fn remove_handler(&mut self, name: &str) -> Option<Value> {
        self.handlers.remove(&name.to_lowercase())
    }

    pub(crate) fn handlers_mut(&mut self) -> &mut HashMap<String, Value> {
        &mut self.handlers
    }

    /// Objects visited while resolving the request path, root first.
    pub fn path(&self) -> &[Value] {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: Vec<Value>) {
        self.path = path;
    }

    pub fn skin_depth(&self) -> usize {
        self.skin_depth
    }

    /// Run a function on this exchange's own engine and thread.
    pub fn invoke_direct(
        &mut self,
        this: Option<&Value>,
        function: &str,
        args: &mut [Value],
    ) -> Result<Value, ScriptError> {
        let engine = Arc::clone(&self.engine);
        engine.invoke(
            self,
            this,
            &FunctionRef::from(function),
            args,
            ArgsWrap::Default,
            false,
        )
    }

    /// Mark the response as redirected and return the signal to propagate.
    pub fn redirect(&mut self, url: &str) -> ScriptError {
        self.response.set_redirect(url);
        ScriptError::Redirect(url.to_string())
    }

    /// Render a skin looked up by name for `this`.
    ///
    /// `name#sub` selects a subskin; `#sub` alone refers to a subskin of
    /// the skin currently being rendered.
    pub fn render_skin(
        &mut self,
        name: &str,
        this: Option<&Value>,
        param: Option<ParamMap>,
    ) -> Result<(), ScriptError> {
        let (skin_name, subskin) = match name.split_once('#') {
            Some((skin_name, sub)) => (skin_name, Some(sub)),
            None => (name, None),
        };
        let skin = if skin_name.is_empty() {
            self.active_skin
                .clone()
                .ok_or_else(|| ScriptError::NotFound(format!("Skin {name}")))?
        } else {
            let prototype = this.and_then(|v| self.app.graph().prototype_name(v));
            self.app
                .skins()
                .get_skin(self.app.prototypes(), prototype.as_deref(), skin_name)?
                .ok_or_else(|| ScriptError::NotFound(format!("Skin {name}")))?
        };
        match subskin {
            Some(sub) => self.render_subskin(&skin, sub, this, param),
            None => self.render(&skin, this, param),
        }
    }

    /// Like [`render_skin`](Self::render_skin), returning the output instead
    /// of writing it to the response.
    pub fn render_skin_as_string(
        &mut self,
        name: &str,
        this: Option<&Value>,
        param: Option<ParamMap>,
    ) -> Result<String, ScriptError> {
        self.response.push_buffer();
        let result = self.render_skin(name, this, param);
        let output = self.response.pop_string();
        result.map(|_| output)
    }

    /// Render a skin's main body.
    pub fn render(
        &mut self,
        skin: &Arc<Skin>,
        this: Option<&Value>,
        param: Option<ParamMap>,
    ) -> Result<(), ScriptError> {
        skin::render::render_body(self, skin, None, this, param_value(param))
    }

    pub fn render_subskin(
        &mut self,
        skin: &Arc<Skin>,
        name: &str,
        this: Option<&Value>,
        param: Option<ParamMap>,
    ) -> Result<(), ScriptError> {
        if !skin.has_subskin(name) {
            return Err(ScriptError::NotFound(format!("Subskin {name}")));
        }
        skin::render::render_body(self, skin, Some(name), this, param_value(param))
    }
}

fn param_value(param: Option<ParamMap>) -> Value {
    param.map_or(Value::Null, Value::Map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_action_cuts_suffix() {
        let mut req = RequestTrans::get("/a");
        req.set_action("edit_action_post");
        assert_eq!(req.action(), Some("edit"));
        req.set_action("main");
        assert_eq!(req.action(), Some("main"));
    }

    #[test]
    fn test_fingerprint_requires_session() {
        assert!(RequestTrans::get("/a").fingerprint().is_none());

        let a = RequestTrans::get("/Docs").with_session("s1").fingerprint();
        let b = RequestTrans::get("/docs").with_session("s1").fingerprint();
        let c = RequestTrans::post("/docs").with_session("s1").fingerprint();
        let d = RequestTrans::get("/docs")
            .with_session("s1")
            .with_param("q", "x")
            .fingerprint();

        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_ne!(b, d);
    }

    #[test]
    fn test_params_mirror_into_data_node() {
        let req = RequestTrans::get("/").with_param("name", "kiln");
        let node = req.data().downcast_ref::<TransientNode>().unwrap();
        assert_eq!(node.get("name"), Some(Value::from("kiln")));
    }

    #[test]
    fn test_buffer_stack() {
        let mut res = ResponseTrans::new();
        res.write("a");
        res.push_buffer();
        res.write("b");
        assert_eq!(res.pop_string(), "b");
        res.write("c");
        assert_eq!(res.snapshot().body, "ac");
    }

    #[test]
    fn test_split_and_insert() {
        let mut res = ResponseTrans::new();
        res.write("hello world");
        assert_eq!(res.split_off(5), " world");
        res.insert_at(0, ">");
        assert_eq!(res.snapshot().body, ">hello");
        assert_eq!(res.split_off(99), "");
    }

    #[test]
    fn test_report_error_escapes() {
        let mut res = ResponseTrans::new();
        res.write("partial");
        res.report_error("demo", "<boom>");
        let snap = res.snapshot();
        assert_eq!(snap.status, 500);
        assert_eq!(
            snap.body,
            "<html><body><h3>Error in application demo</h3>&lt;boom&gt;</body></html>"
        );
    }

    #[test]
    fn test_restore_messages() {
        let mut res = ResponseTrans::new();
        res.restore_messages(PendingMessages {
            message: Some("Saved".to_string()),
            debug: None,
        });
        assert_eq!(res.message(), Some("Saved"));
        assert_eq!(res.pending_messages().message.as_deref(), Some("Saved"));
    }
}
