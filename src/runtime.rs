//! QuickJS sandbox runtime.
//!
//! One [`ExtensionRuntime`] per loaded extension: it owns the VM, installs
//! the curated host API surface, and bounds execution time. Values cross the
//! sandbox boundary as plain JSON trees in both directions; the host never
//! hands the VM a live object. The runtime is deliberately `!Sync`: only one
//! caller may drive a given VM at a time.

use crate::error::{Error, Result};
use crate::extension::LoadedExtension;
use crate::http_util::DEFAULT_TIMEOUT;
use crate::services::HostServices;
use parking_lot::Mutex;
use rquickjs::{Array, Context, Ctx, Exception, IntoJs, Object, Runtime as JsRuntime, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Deadline flag shared between the watchdog timer and the QuickJS interrupt
/// handler. The handler returns `true` once the flag is set, which interrupts
/// the VM at its next safe point.
#[derive(Debug, Default)]
pub(crate) struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct CachedClient {
    client: reqwest::blocking::Client,
    proxy_generation: u64,
}

/// Capability handle captured by every host-API closure.
///
/// The API surface is a set of methods on this one value; the polyfills are
/// thin wrappers over the same handles, not a second code path.
pub(crate) struct ApiState {
    pub(crate) extension: Arc<LoadedExtension>,
    pub(crate) services: Arc<HostServices>,
    http: Mutex<Option<CachedClient>>,
}

impl ApiState {
    fn new(extension: Arc<LoadedExtension>, services: Arc<HostServices>) -> Self {
        Self {
            extension,
            services,
            http: Mutex::new(None),
        }
    }

    /// The runtime's shared HTTP client with its in-memory cookie jar.
    ///
    /// Rebuilt lazily when the process-wide proxy generation changes;
    /// requests already in flight finish on the client they started with.
    pub(crate) fn http_client(&self) -> Result<reqwest::blocking::Client> {
        let mut slot = self.http.lock();
        let generation = self.services.proxy_generation();
        if let Some(cached) = slot.as_ref() {
            if cached.proxy_generation == generation {
                return Ok(cached.client.clone());
            }
        }
        let client = self.services.build_http_client(DEFAULT_TIMEOUT)?;
        *slot = Some(CachedClient {
            client: client.clone(),
            proxy_generation: generation,
        });
        Ok(client)
    }

    /// Drop the cached client; the next request builds a fresh one with an
    /// empty cookie jar.
    pub(crate) fn clear_cookies(&self) {
        *self.http.lock() = None;
    }
}

/// A sandboxed VM bound to one extension.
pub struct ExtensionRuntime {
    #[allow(dead_code)]
    runtime: JsRuntime,
    pub(crate) context: Context,
    pub(crate) state: Arc<ApiState>,
    pub(crate) interrupt: Arc<InterruptFlag>,
}

impl ExtensionRuntime {
    /// Create the VM for an extension and install the host API surface.
    pub fn new(extension: Arc<LoadedExtension>, services: Arc<HostServices>) -> Result<Self> {
        let runtime = JsRuntime::new().map_err(map_js_error)?;
        let context = Context::full(&runtime).map_err(map_js_error)?;

        let interrupt = Arc::new(InterruptFlag::default());
        {
            let flag = Arc::clone(&interrupt);
            runtime.set_interrupt_handler(Some(Box::new(move || flag.is_set())));
        }

        let state = Arc::new(ApiState::new(extension, services));
        let instance = Self {
            runtime,
            context,
            state,
            interrupt,
        };
        instance.register_apis()?;
        Ok(instance)
    }

    pub fn extension(&self) -> &LoadedExtension {
        &self.state.extension
    }

    pub fn services(&self) -> &Arc<HostServices> {
        &self.state.services
    }

    /// Evaluate the extension's own script source (global setup).
    pub fn load_script(&self) -> Result<serde_json::Value> {
        let script = self.state.extension.script.clone();
        self.eval(&script)
    }

    /// Evaluate a script with no explicit deadline and return its completion
    /// value as a JSON tree.
    pub fn eval(&self, source: &str) -> Result<serde_json::Value> {
        self.context.with(|ctx| eval_to_json(&ctx, source))
    }

    fn register_apis(&self) -> Result<()> {
        self.context
            .with(|ctx| -> rquickjs::Result<()> {
                crate::runtime_http::register(&ctx, &self.state)?;
                crate::runtime_file::register(&ctx, &self.state)?;
                crate::runtime_storage::register(&ctx, &self.state)?;
                crate::runtime_auth::register(&ctx, &self.state)?;
                crate::runtime_ffmpeg::register(&ctx, &self.state)?;
                crate::runtime_matching::register(&ctx)?;
                crate::runtime_utils::register(&ctx)?;
                crate::runtime_polyfills::register(&ctx, &self.state)?;
                Ok(())
            })
            .map_err(map_js_error)
    }
}

pub(crate) fn eval_to_json(ctx: &Ctx<'_>, source: &str) -> Result<serde_json::Value> {
    match ctx.eval::<Value, _>(source) {
        Ok(value) => js_to_json(&value).map_err(|err| Error::script(err.to_string())),
        Err(err) => Err(Error::script(describe_js_error(ctx, &err))),
    }
}

// ---------------------------------------------------------------------------
// Boundary conversions
// ---------------------------------------------------------------------------

/// Convert a JSON tree into a live JS value.
#[allow(clippy::option_if_let_else)]
pub(crate) fn json_to_js<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
) -> rquickjs::Result<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => n.as_i64().and_then(|i| i32::try_from(i).ok()).map_or_else(
            || {
                n.as_f64().map_or_else(
                    || Ok(Value::new_null(ctx.clone())),
                    |f| Ok(Value::new_float(ctx.clone(), f)),
                )
            },
            |i| Ok(Value::new_int(ctx.clone(), i)),
        ),
        serde_json::Value::String(s) => s.clone().into_js(ctx),
        serde_json::Value::Array(items) => {
            let js_arr = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                js_arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(js_arr.into_value())
        }
        serde_json::Value::Object(map) => {
            let js_obj = Object::new(ctx.clone())?;
            for (key, item) in map {
                js_obj.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            Ok(js_obj.into_value())
        }
    }
}

// ---------------------------------------------------------------------------
// Closure lifetime helpers
// ---------------------------------------------------------------------------
//
// Closures passed to `Func::from` that take a `Ctx<'_>` parameter and return
// a value borrowed from it (e.g. `Value<'_>`) don't get the same lifetime
// elision a plain `fn` would: the compiler assigns the parameter and return
// positions distinct, unrelated lifetimes, which then fails to unify. Running
// the closure through one of these identity functions forces a single named
// `'js` across both positions at the call site, without changing behavior.
pub(crate) fn constrain0<'js, F>(f: F) -> F
where
    F: Fn(Ctx<'js>) -> rquickjs::Result<Value<'js>>,
{
    f
}

pub(crate) fn constrain1<'js, A, F>(f: F) -> F
where
    F: Fn(Ctx<'js>, A) -> rquickjs::Result<Value<'js>>,
{
    f
}

pub(crate) fn constrain2<'js, A, B, F>(f: F) -> F
where
    F: Fn(Ctx<'js>, A, B) -> rquickjs::Result<Value<'js>>,
{
    f
}

pub(crate) fn constrain3<'js, A, B, C, F>(f: F) -> F
where
    F: Fn(Ctx<'js>, A, B, C) -> rquickjs::Result<Value<'js>>,
{
    f
}

/// Convert a JS value into a JSON tree. Functions and symbols collapse to
/// `null`.
pub(crate) fn js_to_json(value: &Value<'_>) -> rquickjs::Result<serde_json::Value> {
    if value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::json!(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(serde_json::json!(f));
    }
    if let Some(s) = value.as_string() {
        let s = s.to_string()?;
        return Ok(serde_json::Value::String(s));
    }
    if let Some(arr) = value.as_array() {
        let mut result = Vec::new();
        for i in 0..arr.len() {
            let item: Value<'_> = arr.get(i)?;
            result.push(js_to_json(&item)?);
        }
        return Ok(serde_json::Value::Array(result));
    }
    if let Some(obj) = value.as_object() {
        let mut result = serde_json::Map::new();
        for prop in obj.props::<String, Value<'_>>() {
            let (key, item) = prop?;
            result.insert(key, js_to_json(&item)?);
        }
        return Ok(serde_json::Value::Object(result));
    }
    Ok(serde_json::Value::Null)
}

/// Conversion for optional API arguments: absent, undefined, or
/// unconvertible input collapses to `null`.
pub(crate) fn opt_value_to_json(value: Option<&Value<'_>>) -> serde_json::Value {
    value
        .and_then(|v| js_to_json(v).ok())
        .unwrap_or(serde_json::Value::Null)
}

/// `{ error }` shape used by the HTTP-style APIs.
pub(crate) fn error_value(message: impl Into<String>) -> serde_json::Value {
    let message: String = message.into();
    serde_json::json!({ "error": message })
}

/// `{ success: false, error }` shape used by the file-style APIs.
pub(crate) fn failure_value(message: impl Into<String>) -> serde_json::Value {
    let message: String = message.into();
    serde_json::json!({ "success": false, "error": message })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) fn map_js_error(err: rquickjs::Error) -> Error {
    Error::script(format!("QuickJS: {err}"))
}

/// Render a QuickJS error, pulling the message out of a thrown exception.
pub(crate) fn describe_js_error(ctx: &Ctx<'_>, err: &rquickjs::Error) -> String {
    if matches!(err, rquickjs::Error::Exception) {
        let caught = ctx.catch();
        if let Ok(obj) = caught.clone().try_into_object() {
            if let Ok(message) = obj.get::<_, String>("message") {
                return message;
            }
            if let Some(exception) = Exception::from_object(obj) {
                if let Some(message) = exception.message() {
                    return message;
                }
            }
        }
        if let Some(text) = caught.as_string() {
            if let Ok(text) = text.to_string() {
                return text;
            }
        }
    }
    err.to_string()
}
