//! Request path resolution and action lookup.

use std::sync::Arc;

use kiln_types::Value;

use crate::engine::{ArgsWrap, FunctionRef};
use crate::error::ScriptError;
use crate::exchange::{Exchange, XMLRPC_METHOD};

/// Longest request path accepted, in segments.
pub const MAX_PATH_SEGMENTS: usize = 50;

/// The object a request path leads to and the action to run on it.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub target: Value,
    pub action: String,
}

/// Walk the request path from `root`.
///
/// The last segment is first tried as an action name on the current object
/// (unless the path ends with a slash), then as a child. Every object
/// visited is recorded on the exchange, including on failure.
pub fn resolve(cx: &mut Exchange, root: &Value) -> Result<Resolved, ScriptError> {
    let path = cx.request.path().to_string();
    let mut visited = vec![root.clone()];
    let resolved = walk(cx, root, &path, &mut visited);
    cx.set_path(visited);
    resolved
}

fn walk(
    cx: &mut Exchange,
    root: &Value,
    path: &str,
    visited: &mut Vec<Value>,
) -> Result<Resolved, ScriptError> {
    let tokens: Vec<&str> = path.split('/').filter(|t| !t.is_empty()).collect();
    if tokens.len() > MAX_PATH_SEGMENTS {
        return Err(ScriptError::runtime(format!(
            "Path too long: more than {MAX_PATH_SEGMENTS} segments"
        )));
    }
    let trailing_slash = path.ends_with('/');

    let mut current = root.clone();
    let mut action = None;
    for (i, token) in tokens.iter().enumerate() {
        if i == tokens.len() - 1 && !trailing_slash {
            action = get_action(cx, &current, Some(token));
        }
        if action.is_none() {
            current = child_element(cx, &current, token)?
                .ok_or_else(|| ScriptError::NotFound(format!("Object not found: {token}")))?;
            visited.push(current.clone());
        }
    }

    let action = match action {
        Some(action) => action,
        None => get_action(cx, &current, None)
            .ok_or_else(|| ScriptError::NotFound(format!("Action not found on {current}")))?,
    };
    Ok(Resolved {
        target: current,
        action,
    })
}

/// Find the action function for `name` (`main` when `None`) on `object`.
///
/// Tries `<name>_action_xmlrpc` for XML-RPC capable requests (switching
/// the request to XML-RPC when found), then `<name>_action_<method>`, then
/// plain `<name>_action` for GET, POST and HEAD.
pub fn get_action(cx: &mut Exchange, object: &Value, name: Option<&str>) -> Option<String> {
    let engine = Arc::clone(cx.engine());
    let has = |function: &str| engine.has_function(Some(object), function, false);
    let base = format!("{}_action", name.unwrap_or("main"));

    if cx.request.check_xmlrpc() {
        let function = format!("{base}_xmlrpc");
        if has(&function) {
            cx.request.set_method(XMLRPC_METHOD);
            return Some(function);
        }
    }

    let method = cx.request.method().to_string();
    if !method.is_empty() {
        let function = format!("{base}_{}", method.to_lowercase());
        if has(&function) {
            return Some(function);
        }
    }

    if matches!(method.as_str(), "" | "GET" | "POST" | "HEAD") && has(&base) {
        return Some(base);
    }
    None
}

/// Child of `parent` named `name`, asking the object's own
/// `getChildElement` first and the object graph otherwise.
pub fn child_element(
    cx: &mut Exchange,
    parent: &Value,
    name: &str,
) -> Result<Option<Value>, ScriptError> {
    let engine = Arc::clone(cx.engine());
    if engine.has_function(Some(parent), "getChildElement", false) {
        let mut args = [Value::from(name)];
        let child = engine.invoke(
            cx,
            Some(parent),
            &FunctionRef::from("getChildElement"),
            &mut args,
            ArgsWrap::Default,
            false,
        )?;
        return Ok((!child.is_null()).then_some(child));
    }
    Ok(cx.app().graph().child_element(parent, name))
}

/// Register the visited path objects as macro handlers.
///
/// Each object is registered under its own prototype name (deeper objects
/// win), then under its ancestor prototype names where still free, deepest
/// object first.
pub fn register_handlers(cx: &mut Exchange) {
    let app = Arc::clone(cx.app());
    let path = cx.path().to_vec();
    let prototypes: Vec<Option<String>> =
        path.iter().map(|o| app.graph().prototype_name(o)).collect();

    let handlers = cx.handlers_mut();
    for (object, prototype) in path.iter().zip(&prototypes) {
        if let Some(prototype) = prototype {
            handlers.insert(prototype.to_lowercase(), object.clone());
        }
    }
    for (object, prototype) in path.iter().zip(&prototypes).rev() {
        if let Some(prototype) = prototype {
            app.prototypes().register_parents(prototype, object, handlers);
        }
    }
}
