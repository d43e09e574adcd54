//! QuickJS glue shared by every provider: JSON marshalling, exception
//! mapping, native function installation and job draining.

use std::panic::{catch_unwind, AssertUnwindSafe};

use rquickjs::convert::Coerced;
use rquickjs::{Context, Ctx, Function, Runtime, Value as JsValue};
use serde_json::{json, Value as Json};
use tracing::{debug, error, info, warn};

use crate::errors::{NativeError, SandboxError};
use crate::options::{native, NativeFunction, RuntimeOptions};

const ASYNC_SLOT: &str = "__rill_async_slot";
const NATIVE_PREFIX: &str = "__rill_native_";

const CONSOLE_SHIM: &str = r#"(function () {
  function show(value) {
    if (typeof value === 'string') return value;
    if (value instanceof Error) return value.name + ': ' + value.message;
    try {
      var text = JSON.stringify(value);
      return text === undefined ? String(value) : text;
    } catch (e) {
      return String(value);
    }
  }
  function level(name) {
    return function () {
      var parts = [];
      for (var i = 0; i < arguments.length; i++) parts.push(show(arguments[i]));
      __rill_log(name, parts.join(' '));
    };
  }
  globalThis.console = {
    log: level('log'),
    info: level('info'),
    warn: level('warn'),
    error: level('error'),
    debug: level('debug')
  };
})();"#;

pub(crate) fn new_runtime(options: &RuntimeOptions, limits: bool) -> Result<Runtime, SandboxError> {
    let rt = Runtime::new().map_err(|e| SandboxError::Unavailable(e.to_string()))?;
    if limits {
        if let Some(bytes) = options.memory_limit {
            rt.set_memory_limit(bytes);
        }
        if let Some(bytes) = options.max_stack_size {
            rt.set_max_stack_size(bytes);
        }
    }
    Ok(rt)
}

/// Create a context with the console shim and the default log sink installed.
pub(crate) fn new_context(rt: &Runtime) -> Result<Context, SandboxError> {
    let context = Context::full(rt).map_err(|e| SandboxError::Internal(e.to_string()))?;
    context.with(|ctx| {
        install_native(&ctx, "__rill_log", default_log())?;
        ctx.eval::<(), _>(CONSOLE_SHIM).map_err(|e| js_error(&ctx, e))
    })?;
    Ok(context)
}

fn default_log() -> NativeFunction {
    native(|args| {
        let level = args.first().and_then(Json::as_str).unwrap_or("log");
        let message = args.get(1).and_then(Json::as_str).unwrap_or_default();
        match level {
            "warn" => warn!(target: "rill::guest", "{}", message),
            "error" => error!(target: "rill::guest", "{}", message),
            "debug" => debug!(target: "rill::guest", "{}", message),
            _ => info!(target: "rill::guest", "{}", message),
        }
        Ok(Json::Null)
    })
}

/// Map an rquickjs error, pulling the pending exception out of the context.
pub(crate) fn js_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> SandboxError {
    if !matches!(err, rquickjs::Error::Exception) {
        return SandboxError::Internal(err.to_string());
    }
    exception_to_error(&ctx.catch())
}

fn exception_to_error(thrown: &JsValue<'_>) -> SandboxError {
    if let Some(obj) = thrown.as_object() {
        let name = obj
            .get::<_, Option<String>>("name")
            .ok()
            .flatten()
            .unwrap_or_else(|| "Error".to_string());
        let message = obj
            .get::<_, Option<Coerced<String>>>("message")
            .ok()
            .flatten()
            .map(|c| c.0)
            .unwrap_or_default();
        let stack = obj
            .get::<_, Option<String>>("stack")
            .ok()
            .flatten()
            .filter(|s| !s.is_empty());
        return SandboxError::Execution {
            name,
            message,
            stack,
        };
    }

    let message = thrown
        .get::<Coerced<String>>()
        .map(|c| c.0)
        .unwrap_or_else(|_| "uncaught exception".to_string());
    SandboxError::execution("Error", message)
}

pub(crate) fn to_json<'js>(ctx: &Ctx<'js>, value: JsValue<'js>) -> Result<Json, SandboxError> {
    if value.is_undefined() || value.is_function() {
        return Ok(Json::Null);
    }
    let text = ctx.json_stringify(value).map_err(|e| js_error(ctx, e))?;
    match text {
        None => Ok(Json::Null),
        Some(text) => {
            let text = text.to_string().map_err(|e| js_error(ctx, e))?;
            serde_json::from_str(&text).map_err(|e| SandboxError::Internal(e.to_string()))
        }
    }
}

pub(crate) fn from_json<'js>(ctx: &Ctx<'js>, value: &Json) -> Result<JsValue<'js>, SandboxError> {
    ctx.json_parse(value.to_string()).map_err(|e| js_error(ctx, e))
}

pub(crate) fn eval_json(ctx: &Ctx<'_>, code: &str) -> Result<Json, SandboxError> {
    let value: JsValue = ctx.eval(code).map_err(|e| js_error(ctx, e))?;
    to_json(ctx, value)
}

pub(crate) fn set_global(ctx: &Ctx<'_>, name: &str, value: &Json) -> Result<(), SandboxError> {
    let value = from_json(ctx, value)?;
    ctx.globals().set(name, value).map_err(|e| js_error(ctx, e))
}

pub(crate) fn get_global(ctx: &Ctx<'_>, name: &str) -> Result<Json, SandboxError> {
    let value: JsValue = ctx.globals().get(name).map_err(|e| js_error(ctx, e))?;
    to_json(ctx, value)
}

/// Source for calling a global function with `args`.
///
/// The arguments travel as one string literal handed to `JSON.parse`. Object
/// literal syntax would treat a `__proto__` key as a prototype assignment.
pub(crate) fn call_source(function: &str, args: &[Json]) -> String {
    let text = Json::Array(args.to_vec()).to_string();
    format!("{}.apply(undefined, JSON.parse({}))", function, Json::from(text))
}

/// Install `f` as the global `name`.
///
/// The raw binding exchanges JSON text; a small JS wrapper turns `{err}`
/// envelopes into thrown errors so native failures surface as ordinary
/// guest exceptions.
pub(crate) fn install_native(
    ctx: &Ctx<'_>,
    name: &str,
    f: NativeFunction,
) -> Result<(), SandboxError> {
    let raw_name = format!("{NATIVE_PREFIX}{name}");
    let func = Function::new(ctx.clone(), move |payload: String| -> String {
        invoke_native(&f, &payload)
    })
    .map_err(|e| js_error(ctx, e))?;
    ctx.globals()
        .set(raw_name.as_str(), func)
        .map_err(|e| js_error(ctx, e))?;

    let glue = format!(
        r#"(function (raw, name) {{
  var binding = globalThis[raw];
  delete globalThis[raw];
  globalThis[name] = function () {{
    var out = JSON.parse(binding(JSON.stringify(Array.prototype.slice.call(arguments))));
    if (out.err) {{
      var error = new Error(out.err.message);
      error.name = out.err.name;
      throw error;
    }}
    return out.ok;
  }};
}})({raw}, {name});"#,
        raw = Json::from(raw_name.as_str()),
        name = Json::from(name),
    );
    ctx.eval::<(), _>(glue).map_err(|e| js_error(ctx, e))
}

fn invoke_native(f: &NativeFunction, payload: &str) -> String {
    let outcome = match serde_json::from_str::<Vec<Json>>(payload) {
        Ok(args) => catch_unwind(AssertUnwindSafe(|| f(args))).unwrap_or_else(|_| {
            Err(NativeError::new("InternalError", "native function panicked"))
        }),
        Err(e) => Err(NativeError::type_error(format!("arguments are not JSON: {e}"))),
    };
    let envelope = match outcome {
        Ok(value) => json!({ "ok": value }),
        Err(err) => json!({ "err": { "name": err.name, "message": err.message } }),
    };
    envelope.to_string()
}

/// Run queued microtasks until the queue is empty or `stop` says otherwise.
pub(crate) fn drain_jobs(rt: &Runtime, stop: &dyn Fn() -> bool) -> usize {
    let mut ran = 0;
    while !stop() {
        match rt.execute_pending_job() {
            Ok(true) => ran += 1,
            Ok(false) => break,
            Err(_) => {
                ran += 1;
                warn!(target: "rill_sandbox::jobs", "pending job raised an exception");
            }
        }
    }
    ran
}

/// Wrap `code` so its completion value (promise or not) lands in a global
/// slot once settled.
pub(crate) fn resolving_source(code: &str) -> String {
    format!(
        r#"(function () {{
  var slot = globalThis.{slot} = {{ done: false }};
  new Promise(function (resolve) {{ resolve((0, eval)({code})); }}).then(
    function (value) {{ slot.done = true; slot.value = value; }},
    function (error) {{
      slot.done = true;
      slot.failed = true;
      slot.error = {{
        name: (error && error.name) || 'Error',
        message: error && error.message !== undefined ? String(error.message) : String(error),
        stack: error && error.stack
      }};
    }}
  );
}})();"#,
        slot = ASYNC_SLOT,
        code = Json::from(code),
    )
}

/// Read and clear the slot written by [`resolving_source`].
///
/// A promise still pending after the job queue drained is waiting on the
/// host; that resolves to `null`.
pub(crate) fn take_resolved(ctx: &Ctx<'_>) -> Result<Json, SandboxError> {
    let slot = eval_json(
        ctx,
        &format!(
            "(function () {{ var s = globalThis.{ASYNC_SLOT}; delete globalThis.{ASYNC_SLOT}; return s; }})()"
        ),
    )?;

    if slot.get("done").and_then(Json::as_bool) != Some(true) {
        debug!(target: "rill_sandbox::jobs", "completion promise still pending after drain");
        return Ok(Json::Null);
    }
    if slot.get("failed").and_then(Json::as_bool) == Some(true) {
        let error = &slot["error"];
        return Err(SandboxError::Execution {
            name: error["name"].as_str().unwrap_or("Error").to_string(),
            message: error["message"].as_str().unwrap_or_default().to_string(),
            stack: error["stack"].as_str().map(str::to_string),
        });
    }
    Ok(slot.get("value").cloned().unwrap_or(Json::Null))
}

/// Remove every enumerable global so a disposed context keeps nothing alive.
pub(crate) fn clear_globals(ctx: &Ctx<'_>) {
    let globals = ctx.globals();
    let keys: Vec<String> = globals.keys::<String>().filter_map(Result::ok).collect();
    for key in keys {
        if let Err(e) = globals.remove(key.as_str()) {
            debug!(target: "rill_sandbox::dispose", "failed to remove global {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_source_parses_arguments_from_a_string() {
        let args = vec![json!({"type": "DESTROY"}), json!("a\"b")];
        let src = call_source("__rill_receive", &args);
        let literal = src
            .strip_prefix("__rill_receive.apply(undefined, JSON.parse(")
            .and_then(|rest| rest.strip_suffix("))"))
            .unwrap();
        let text: String = serde_json::from_str(literal).unwrap();
        assert_eq!(serde_json::from_str::<Json>(&text).unwrap(), Json::Array(args));
    }

    #[test]
    fn test_native_envelopes() {
        let ok = native(|args| Ok(json!(args.len())));
        assert_eq!(invoke_native(&ok, "[1,2]"), r#"{"ok":2}"#);

        let failing = native(|_| Err(NativeError::type_error("nope")));
        let out: Json = serde_json::from_str(&invoke_native(&failing, "[]")).unwrap();
        assert_eq!(out["err"]["name"], "TypeError");

        let out: Json = serde_json::from_str(&invoke_native(&ok, "not json")).unwrap();
        assert_eq!(out["err"]["name"], "TypeError");
    }

    #[test]
    fn test_native_panic_becomes_error() {
        let panicking = native(|_| panic!("boom"));
        let out: Json = serde_json::from_str(&invoke_native(&panicking, "[]")).unwrap();
        assert_eq!(out["err"]["name"], "InternalError");
    }
}
