//! Skin rendering.
//!
//! Rendering walks a body's parts, writing text straight to the response
//! and evaluating each macro against its handler. Macro failures are
//! written inline as ` [message] ` so one broken macro does not take the
//! page down; redirects, conflicts, timeouts, aborts and recursion errors
//! propagate instead.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_types::{ParamMap, Value};
use tracing::{debug, error};

use super::encode::Encoding;
use super::parser::{FailMode, HandlerKind, Macro, Param, Part, Skin};
use crate::engine::ScriptingEngine;
use crate::error::ScriptError;
use crate::exchange::Exchange;

/// Hops allowed when searching the parent chain for a handler.
const MAX_PARENT_HOPS: usize = 50;

/// Bodies with more macros than this cache handler lookups.
const HANDLER_CACHE_THRESHOLD: usize = 3;

/// State for one pass over a skin body.
struct RenderContext {
    this: Option<Value>,
    handlers: Option<HashMap<String, Option<Value>>>,
}

impl RenderContext {
    fn remember(&mut self, key: String, handler: Option<Value>) -> Option<Value> {
        if let Some(cache) = &mut self.handlers {
            cache.insert(key, handler.clone());
        }
        handler
    }
}

/// Standard parameters after evaluation.
#[derive(Debug, Default)]
struct Decorations {
    prefix: Option<String>,
    suffix: Option<String>,
    default: Option<String>,
}

impl Decorations {
    /// Pick up values a macro function may have changed in its parameter map.
    fn read_from(&mut self, params: &ParamMap, engine: &dyn ScriptingEngine) {
        let read = |key: &str| {
            params
                .get(key)
                .filter(|v| !v.is_null())
                .map(|v| engine.to_display_string(v))
        };
        self.prefix = read("prefix");
        self.suffix = read("suffix");
        self.default = read("default");
    }
}

/// Render the main body, or the named subskin, of `skin` into the response.
pub(crate) fn render_body(
    cx: &mut Exchange,
    skin: &Arc<Skin>,
    subskin: Option<&str>,
    this: Option<&Value>,
    param: Value,
) -> Result<(), ScriptError> {
    let max_depth = cx.app().config().skins().max_depth;
    cx.skin_depth += 1;
    if cx.skin_depth > max_depth {
        cx.skin_depth -= 1;
        return Err(ScriptError::SkinRecursion(max_depth));
    }

    let previous_param = cx.set_handler("param", param);
    let previous_skin = cx.active_skin.replace(Arc::clone(skin));

    let result = render_parts(cx, skin, subskin, this);

    cx.active_skin = previous_skin;
    match previous_param {
        Some(previous) => {
            cx.set_handler("param", previous);
        }
        None => {
            cx.remove_handler("param");
        }
    }
    cx.skin_depth -= 1;
    result
}

fn render_parts(
    cx: &mut Exchange,
    skin: &Skin,
    subskin: Option<&str>,
    this: Option<&Value>,
) -> Result<(), ScriptError> {
    let body = match subskin {
        Some(name) => skin
            .subskin(name)
            .ok_or_else(|| ScriptError::NotFound(format!("Subskin {name}")))?,
        None => skin.main(),
    };
    let mut rc = RenderContext {
        this: this.cloned(),
        handlers: (body.macros().count() > HANDLER_CACHE_THRESHOLD).then(HashMap::new),
    };
    for part in body.parts() {
        match part {
            Part::Text(text) => cx.write(text),
            Part::Macro(m) => render_macro(cx, &mut rc, skin, m)?,
        }
    }
    Ok(())
}

fn render_macro(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    m: &Macro,
) -> Result<(), ScriptError> {
    let start = cx.response.buffer_len();
    match evaluate(cx, rc, skin, m, start) {
        Ok(()) => Ok(()),
        Err(e) if e.escapes_macro() => Err(e),
        Err(e) if m.standard_params().failmode == FailMode::Silent => {
            debug!(r#macro = ?m.name(), error = %e, "Macro failed silently");
            Ok(())
        }
        Err(ScriptError::Macro(message)) => {
            error!(r#macro = ?m.name(), %message, "Macro failed");
            cx.write(&format!(" [{message}] "));
            Ok(())
        }
        Err(e) => {
            let message = format!("Macro error in {}: {e}", m.name().unwrap_or_default());
            error!(r#macro = ?m.name(), error = %e, "Macro error");
            cx.write(&format!(" [{message}] "));
            Ok(())
        }
    }
}

fn evaluate(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    m: &Macro,
    start: usize,
) -> Result<(), ScriptError> {
    let mut decorations = decorations(cx, rc, skin, m)?;
    let value = invoke_as_macro(cx, rc, skin, m, Some(&mut decorations), m.filter().is_some())?;

    if cx.response.buffer_len() == start {
        write_value(cx, m, &value, &decorations, true);
        return Ok(());
    }

    // The macro wrote directly to the response.
    if m.encoding() != Encoding::None {
        let output = cx.response.split_off(start);
        write_value(cx, m, &Value::Str(output), &decorations, false);
    } else {
        if let Some(prefix) = &decorations.prefix {
            cx.response.insert_at(start, prefix);
        }
        if let Some(suffix) = &decorations.suffix {
            cx.write(suffix);
        }
    }
    write_value(cx, m, &value, &decorations, false);
    Ok(())
}

/// Write a macro result with its decorations. A missing or empty value
/// falls back to the `default` parameter when `use_default` is set.
fn write_value(cx: &mut Exchange, m: &Macro, value: &Value, decorations: &Decorations, use_default: bool) {
    let text = if value.is_empty() {
        match (&decorations.default, use_default) {
            (Some(default), true) => default.clone(),
            _ => return,
        }
    } else {
        cx.engine().to_display_string(value)
    };
    if text.is_empty() {
        return;
    }

    let decorate = !value.is_null();
    if decorate && let Some(prefix) = &decorations.prefix {
        cx.write(prefix);
    }
    cx.write(&m.encoding().apply(&text));
    if decorate && let Some(suffix) = &decorations.suffix {
        cx.write(suffix);
    }
}

fn decorations(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    m: &Macro,
) -> Result<Decorations, ScriptError> {
    let std = m.standard_params();
    Ok(Decorations {
        prefix: param_string(cx, rc, skin, std.prefix.as_ref())?,
        suffix: param_string(cx, rc, skin, std.suffix.as_ref())?,
        default: param_string(cx, rc, skin, std.default.as_ref())?,
    })
}

fn param_string(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    param: Option<&Param>,
) -> Result<Option<String>, ScriptError> {
    match param {
        None => Ok(None),
        Some(Param::Literal(text)) => Ok(Some(text.clone())),
        Some(Param::Macro(nested)) => {
            let value = invoke_as_parameter(cx, rc, skin, nested)?;
            Ok((!value.is_null()).then(|| cx.engine().to_display_string(&value)))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Invocation
// ─────────────────────────────────────────────────────────────────────────────

fn invoke_as_macro(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    m: &Macro,
    decorations: Option<&mut Decorations>,
    as_object: bool,
) -> Result<Value, ScriptError> {
    let Some(name) = m.name().filter(|_| !m.is_comment()) else {
        return Ok(Value::Null);
    };
    if !skin.allows_macro(name) {
        return Err(ScriptError::Macro(format!("Macro not allowed in sandbox: {name}")));
    }

    let engine = Arc::clone(cx.engine());
    let handler = match m.handler() {
        HandlerKind::Global => None,
        kind => {
            let found = resolve_handler(cx, rc, &m.path()[0], kind);
            match resolve_path(cx, m, found)? {
                Some(handler) => Some(handler),
                None => {
                    if verbose_failmode(m, None, engine.as_ref()) {
                        return Err(ScriptError::Macro(format!("Handler not found for macro {name}")));
                    }
                    return filter(cx, rc, skin, m, Value::Null);
                }
            }
        }
    };
    let handler = handler.as_ref();
    let property = m.property();

    if let Some(function) = resolve_function_name(cx, m, handler, &format!("{property}_macro")) {
        let mut args = prepare_arguments(cx, rc, skin, m, 0)?;
        let start = cx.response.buffer_len();
        let mut value = cx.invoke_direct(handler, &function, &mut args)?;
        if let Some(decorations) = decorations
            && let Some(Value::Map(params)) = args.first()
        {
            decorations.read_from(params, engine.as_ref());
        }
        if as_object && value.is_null() && cx.response.buffer_len() > start {
            value = Value::Str(cx.response.split_off(start));
        }
        return filter(cx, rc, skin, m, value);
    }

    if m.handler() == HandlerKind::Response {
        let special = match property {
            "message" => cx.response.message(),
            "error" => cx.response.error(),
            _ => None,
        };
        if let Some(text) = special {
            let value = Value::from(text);
            return filter(cx, rc, skin, m, value);
        }
    }

    let mut value = Value::Null;
    if engine.has_property(handler, property) {
        value = engine.get_property(handler, property).unwrap_or(Value::Null);
    } else if engine.has_function(handler, "onUnhandledMacro", false) {
        let mut args = prepare_arguments(cx, rc, skin, m, 1)?;
        args[0] = Value::from(property);
        let start = cx.response.buffer_len();
        value = cx.invoke_direct(handler, "onUnhandledMacro", &mut args)?;
        if as_object && value.is_null() && cx.response.buffer_len() > start {
            value = Value::Str(cx.response.split_off(start));
        }
    } else if verbose_failmode(m, handler, engine.as_ref()) {
        return Err(ScriptError::Macro(format!("Unhandled macro: {name}")));
    }
    filter(cx, rc, skin, m, value)
}

/// Evaluate a macro used as the value of another macro's parameter.
fn invoke_as_parameter(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    m: &Macro,
) -> Result<Value, ScriptError> {
    let mut decorations = decorations(cx, rc, skin, m)?;
    let value = invoke_as_macro(cx, rc, skin, m, Some(&mut decorations), true)?;
    if decorations.prefix.is_some() || decorations.suffix.is_some() {
        cx.response.push_buffer();
        write_value(cx, m, &value, &decorations, true);
        return Ok(Value::Str(cx.response.pop_string()));
    }
    if value.is_empty()
        && let Some(default) = decorations.default
    {
        return Ok(Value::Str(default));
    }
    Ok(value)
}

fn filter(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    m: &Macro,
    value: Value,
) -> Result<Value, ScriptError> {
    match m.filter() {
        Some(f) => invoke_as_filter(cx, rc, skin, f, value),
        None => Ok(value),
    }
}

fn invoke_as_filter(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    f: &Macro,
    value: Value,
) -> Result<Value, ScriptError> {
    let Some(name) = f.name() else {
        return Err(ScriptError::Macro("Empty filter".to_string()));
    };
    if !skin.allows_macro(name) {
        return Err(ScriptError::Macro(format!("Filter not allowed in sandbox: {name}")));
    }
    let handler = match f.handler() {
        HandlerKind::Global => None,
        kind => {
            let found = resolve_handler(cx, rc, &f.path()[0], kind);
            resolve_path(cx, f, found)?
        }
    };
    let function = resolve_function_name(cx, f, handler.as_ref(), &format!("{}_filter", f.property()))
        .ok_or_else(|| ScriptError::Macro(format!("Undefined filter: {name}")))?;

    let mut args = prepare_arguments(cx, rc, skin, f, 1)?;
    args[0] = value;
    let result = cx.invoke_direct(handler.as_ref(), &function, &mut args)?;
    filter(cx, rc, skin, f, result)
}

/// Build the argument list: `offset` leading slots, the named parameter
/// map, then the positional parameters.
fn prepare_arguments(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    m: &Macro,
    offset: usize,
) -> Result<Vec<Value>, ScriptError> {
    let mut args = vec![Value::Null; offset];
    let params = if m.has_nested_macros() {
        let mut params = ParamMap::new();
        for (key, param) in m.named_params() {
            let value = param_value(cx, rc, skin, param)?;
            params.insert(key.clone(), value);
        }
        params
    } else {
        m.literal_params().clone()
    };
    args.push(Value::Map(params));
    for param in m.positional_params() {
        let value = param_value(cx, rc, skin, param)?;
        args.push(value);
    }
    Ok(args)
}

fn param_value(
    cx: &mut Exchange,
    rc: &mut RenderContext,
    skin: &Skin,
    param: &Param,
) -> Result<Value, ScriptError> {
    match param {
        Param::Literal(text) => Ok(Value::from(text.as_str())),
        Param::Macro(nested) => invoke_as_parameter(cx, rc, skin, nested),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler resolution
// ─────────────────────────────────────────────────────────────────────────────

fn resolve_handler(
    cx: &Exchange,
    rc: &mut RenderContext,
    name: &str,
    kind: HandlerKind,
) -> Option<Value> {
    match kind {
        HandlerKind::This => return rc.this.clone(),
        HandlerKind::Response => return Some(Value::Object(cx.response.data().clone())),
        HandlerKind::Request => return Some(Value::Object(cx.request.data().clone())),
        HandlerKind::Session => return Some(Value::Object(cx.session().cache_node().clone())),
        HandlerKind::Param => return cx.handler("param").filter(|v| !v.is_null()).cloned(),
        HandlerKind::Global | HandlerKind::Other => {}
    }

    let key = name.to_lowercase();
    if let Some(cache) = &rc.handlers
        && let Some(cached) = cache.get(&key)
    {
        return cached.clone();
    }

    let app = Arc::clone(cx.app());
    let is_instance = |object: &Value| {
        app.graph()
            .prototype_name(object)
            .is_some_and(|proto| app.prototypes().is_instance_of(&proto, name))
    };

    if let Some(this) = rc.this.clone()
        && is_instance(&this)
    {
        return rc.remember(key, Some(this));
    }
    if let Some(handler) = cx.handler(name).filter(|v| !v.is_null()) {
        let handler = handler.clone();
        return rc.remember(key, Some(handler));
    }
    if let Some(this) = rc.this.clone() {
        let mut current = app.graph().parent_element(&this);
        for _ in 0..MAX_PARENT_HOPS {
            let Some(object) = current else { break };
            if is_instance(&object) {
                return rc.remember(key, Some(object));
            }
            current = app.graph().parent_element(&object);
        }
    }
    rc.remember(key, None)
}

/// Walk the intermediate segments of a dotted macro name.
fn resolve_path(
    cx: &mut Exchange,
    m: &Macro,
    handler: Option<Value>,
) -> Result<Option<Value>, ScriptError> {
    let Some(mut handler) = handler else {
        return Ok(None);
    };
    let path = m.path();
    let inner = path.len().saturating_sub(2);
    let engine = Arc::clone(cx.engine());
    for segment in path.iter().skip(1).take(inner) {
        let next = if engine.has_function(Some(&handler), "getMacroHandler", false) {
            let mut args = [Value::from(segment.as_str())];
            cx.invoke_direct(Some(&handler), "getMacroHandler", &mut args)?
        } else {
            Value::Null
        };
        if !next.is_null() {
            handler = next;
            continue;
        }
        if engine.is_typed_object(&handler) {
            return Ok(None);
        }
        match engine.get_property(Some(&handler), segment) {
            Some(value) if !value.is_null() => handler = value,
            _ => return Ok(None),
        }
    }
    Ok(Some(handler))
}

fn resolve_function_name(
    cx: &Exchange,
    m: &Macro,
    handler: Option<&Value>,
    function: &str,
) -> Option<String> {
    let engine = cx.engine();
    if m.handler() != HandlerKind::Global {
        return engine
            .has_function(handler, function, false)
            .then(|| function.to_string());
    }
    let config = cx.app().config();
    let macro_path = &config.skins().global_macro_path;
    if macro_path.is_empty() {
        return engine
            .has_function(None, function, false)
            .then(|| function.to_string());
    }
    macro_path
        .iter()
        .map(|prefix| {
            if prefix.is_empty() {
                function.to_string()
            } else {
                format!("{prefix}.{function}")
            }
        })
        .find(|candidate| engine.has_function(None, candidate, true))
}

/// Unhandled macros are errors when requested, or by default when the
/// handler is missing or not an instance of a declared prototype.
fn verbose_failmode(m: &Macro, handler: Option<&Value>, engine: &dyn ScriptingEngine) -> bool {
    match m.standard_params().failmode {
        FailMode::Verbose => true,
        FailMode::Silent => false,
        FailMode::Default => handler.is_none_or(|h| !engine.is_typed_object(h)),
    }
}
