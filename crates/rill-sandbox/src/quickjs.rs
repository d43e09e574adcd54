//! In-process QuickJS provider with a hard interrupt.
//!
//! Each runtime owns one interpreter heap. Evaluations arm a deadline that
//! the interpreter's interrupt handler polls, so a runaway loop is stopped
//! in place and reported as [`SandboxError::Timeout`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rquickjs::{Context, Ctx, Runtime};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::errors::SandboxError;
use crate::js;
use crate::options::{MemoryStats, NativeFunction, RuntimeOptions};

#[derive(Debug, Default)]
pub(crate) struct Interrupt {
    deadline: Mutex<Option<Instant>>,
    fired: AtomicBool,
}

impl Interrupt {
    fn should_stop(&self) -> bool {
        match *self.deadline.lock() {
            Some(deadline) if Instant::now() >= deadline => {
                self.fired.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn arm(&self, deadline: Instant) {
        *self.deadline.lock() = Some(deadline);
        self.fired.store(false, Ordering::SeqCst);
    }

    fn disarm(&self) -> bool {
        *self.deadline.lock() = None;
        self.fired.swap(false, Ordering::SeqCst)
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Creates [`QuickJsRuntime`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuickJsProvider;

impl QuickJsProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn create_runtime(&self, options: RuntimeOptions) -> Result<QuickJsRuntime, SandboxError> {
        QuickJsRuntime::new(options, true)
    }
}

struct RuntimeInner {
    rt: Runtime,
    options: RuntimeOptions,
    interrupt: Arc<Interrupt>,
    guarded: bool,
    contexts: RefCell<Vec<Weak<ContextInner>>>,
    disposed: Cell<bool>,
}

/// One interpreter heap; cheap to clone.
#[derive(Clone)]
pub struct QuickJsRuntime {
    inner: Rc<RuntimeInner>,
}

impl std::fmt::Debug for QuickJsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickJsRuntime")
            .field("guarded", &self.inner.guarded)
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

impl QuickJsRuntime {
    /// `guarded` installs the interrupt handler and heap limits.
    pub(crate) fn new(options: RuntimeOptions, guarded: bool) -> Result<Self, SandboxError> {
        let rt = js::new_runtime(&options, guarded)?;
        let interrupt = Arc::new(Interrupt::default());
        if guarded {
            let handler = Arc::clone(&interrupt);
            rt.set_interrupt_handler(Some(Box::new(move || handler.should_stop())));
        }
        debug!(
            target: "rill_sandbox::quickjs",
            guarded,
            timeout_ms = options.timeout_ms(),
            "created runtime"
        );
        Ok(Self {
            inner: Rc::new(RuntimeInner {
                rt,
                options,
                interrupt,
                guarded,
                contexts: RefCell::new(Vec::new()),
                disposed: Cell::new(false),
            }),
        })
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    pub fn is_guarded(&self) -> bool {
        self.inner.guarded
    }

    pub fn create_context(&self) -> Result<QuickJsContext, SandboxError> {
        if self.inner.disposed.get() {
            return Err(SandboxError::Disposed);
        }
        let context = js::new_context(&self.inner.rt)?;
        let inner = Rc::new(ContextInner {
            context: RefCell::new(Some(context)),
            runtime: Rc::clone(&self.inner),
        });
        let mut contexts = self.inner.contexts.borrow_mut();
        contexts.retain(|c| c.strong_count() > 0);
        contexts.push(Rc::downgrade(&inner));
        Ok(QuickJsContext { inner })
    }

    pub fn memory_usage(&self) -> Option<MemoryStats> {
        if self.inner.disposed.get() {
            return None;
        }
        let usage = self.inner.rt.memory_usage();
        Some(MemoryStats {
            malloc_bytes: usage.malloc_size.max(0) as u64,
            used_bytes: usage.memory_used_size.max(0) as u64,
            limit_bytes: self
                .inner
                .options
                .memory_limit
                .filter(|_| self.inner.guarded)
                .map(|b| b as u64),
        })
    }

    /// Dispose every context, then the runtime. Pending jobs get one last
    /// drain under the evaluation budget. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        let ran = self.inner.guarded_drain();
        let contexts: Vec<_> = self.inner.contexts.borrow_mut().drain(..).collect();
        for context in contexts.iter().filter_map(Weak::upgrade) {
            context.dispose();
        }
        self.inner.rt.run_gc();
        debug!(target: "rill_sandbox::quickjs", drained_jobs = ran, "disposed runtime");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}

impl RuntimeInner {
    fn guarded_drain(&self) -> usize {
        if self.guarded {
            self.interrupt.arm(Instant::now() + self.options.timeout);
        }
        let ran = js::drain_jobs(&self.rt, &|| self.interrupt.fired());
        if self.interrupt.disarm() {
            warn!(target: "rill_sandbox::quickjs", "pending jobs exceeded the timeout and were abandoned");
        }
        ran
    }
}

struct ContextInner {
    context: RefCell<Option<Context>>,
    runtime: Rc<RuntimeInner>,
}

impl ContextInner {
    fn dispose(&self) {
        if let Some(context) = self.context.borrow_mut().take() {
            context.with(|ctx| js::clear_globals(&ctx));
            drop(context);
            self.runtime.rt.run_gc();
        }
    }
}

/// A global scope inside a [`QuickJsRuntime`].
#[derive(Clone)]
pub struct QuickJsContext {
    inner: Rc<ContextInner>,
}

impl std::fmt::Debug for QuickJsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickJsContext")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl QuickJsContext {
    fn with_ctx<T>(
        &self,
        f: impl FnOnce(&Ctx<'_>) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        if self.inner.runtime.disposed.get() {
            return Err(SandboxError::Disposed);
        }
        let guard = self.inner.context.borrow();
        let context = guard.as_ref().ok_or(SandboxError::Disposed)?;
        context.with(|ctx| f(&ctx))
    }

    /// Run `f` under the evaluation deadline, then drain microtasks.
    fn guarded<T>(
        &self,
        f: impl FnOnce(&Ctx<'_>) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        let runtime = &self.inner.runtime;
        let started = Instant::now();
        if runtime.guarded {
            runtime.interrupt.arm(started + runtime.options.timeout);
        }

        let result = self.with_ctx(f);
        js::drain_jobs(&runtime.rt, &|| runtime.interrupt.fired());

        if runtime.interrupt.disarm() {
            return Err(SandboxError::Timeout {
                limit_ms: runtime.options.timeout_ms(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        result
    }

    pub fn eval(&self, code: &str) -> Result<Json, SandboxError> {
        self.guarded(|ctx| js::eval_json(ctx, code))
    }

    /// Like [`eval`](Self::eval), but a promise completion value is awaited
    /// through the job queue. Yields to the executor first.
    pub async fn eval_async(&self, code: &str) -> Result<Json, SandboxError> {
        tokio::task::yield_now().await;
        let source = js::resolving_source(code);
        self.guarded(|ctx| js::eval_json(ctx, &source))?;
        self.with_ctx(js::take_resolved)
    }

    pub fn set_global(&self, name: &str, value: &Json) -> Result<(), SandboxError> {
        self.with_ctx(|ctx| js::set_global(ctx, name, value))
    }

    pub fn get_global(&self, name: &str) -> Result<Json, SandboxError> {
        self.with_ctx(|ctx| js::get_global(ctx, name))
    }

    pub fn define_function(&self, name: &str, f: NativeFunction) -> Result<(), SandboxError> {
        self.with_ctx(|ctx| js::install_native(ctx, name, f))
    }

    /// Call the global function `function` with JSON arguments.
    pub fn call(&self, function: &str, args: &[Json]) -> Result<Json, SandboxError> {
        let source = js::call_source(function, args);
        self.guarded(|ctx| js::eval_json(ctx, &source))
    }

    /// Release the global scope. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.context.borrow().is_none() || self.inner.runtime.disposed.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::native;
    use serde_json::json;
    use std::time::Duration;

    fn runtime(timeout_ms: u64) -> QuickJsRuntime {
        QuickJsProvider::new()
            .create_runtime(RuntimeOptions::default().with_timeout(Duration::from_millis(timeout_ms)))
            .unwrap()
    }

    #[test]
    fn test_eval_returns_json() {
        let ctx = runtime(1_000).create_context().unwrap();
        assert_eq!(ctx.eval("1 + 2").unwrap(), json!(3));
        assert_eq!(ctx.eval("({a: [1, 'x']})").unwrap(), json!({"a": [1, "x"]}));
        assert_eq!(ctx.eval("undefined").unwrap(), Json::Null);
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let ctx = runtime(50).create_context().unwrap();
        let started = Instant::now();
        let err = ctx.eval("while (true) {}").unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));

        // The context stays usable after an interrupt.
        assert_eq!(ctx.eval("40 + 2").unwrap(), json!(42));
    }

    #[test]
    fn test_exceptions_keep_their_name() {
        let ctx = runtime(1_000).create_context().unwrap();
        let err = ctx.eval("null.x").unwrap_err();
        assert_eq!(err.exception_name(), Some("TypeError"));

        let err = ctx
            .eval("var e = new Error('nope'); e.name = 'UnsupportedRequireError'; throw e")
            .unwrap_err();
        match err {
            SandboxError::Execution { name, message, .. } => {
                assert_eq!(name, "UnsupportedRequireError");
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = ctx.eval("throw 'plain'").unwrap_err();
        assert_eq!(err, SandboxError::execution("Error", "plain"));
    }

    #[test]
    fn test_globals_and_natives() {
        let ctx = runtime(1_000).create_context().unwrap();
        ctx.set_global("config", &json!({"n": 2})).unwrap();
        ctx.define_function("double", native(|args| Ok(json!(args[0].as_f64().unwrap_or(0.0) * 2.0))))
            .unwrap();
        assert_eq!(ctx.eval("double(config.n)").unwrap(), json!(4));
        assert_eq!(ctx.get_global("config").unwrap(), json!({"n": 2}));
        assert_eq!(ctx.eval("typeof __rill_native_double").unwrap(), json!("undefined"));
    }

    #[test]
    fn test_native_error_is_thrown_in_guest() {
        let ctx = runtime(1_000).create_context().unwrap();
        ctx.define_function(
            "fail",
            native(|_| Err(crate::errors::NativeError::new("RangeError", "too far"))),
        )
        .unwrap();
        let caught = ctx
            .eval("try { fail(); 'no' } catch (e) { e.name + ':' + e.message }")
            .unwrap();
        assert_eq!(caught, json!("RangeError:too far"));
    }

    #[test]
    fn test_microtasks_drain_after_eval() {
        let ctx = runtime(1_000).create_context().unwrap();
        ctx.eval("globalThis.hits = 0; Promise.resolve().then(() => { hits += 1; })")
            .unwrap();
        assert_eq!(ctx.get_global("hits").unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_eval_async_resolves_promises() {
        let ctx = runtime(1_000).create_context().unwrap();
        assert_eq!(ctx.eval_async("Promise.resolve(7)").await.unwrap(), json!(7));

        let err = ctx
            .eval_async("Promise.reject(new TypeError('bad'))")
            .await
            .unwrap_err();
        assert_eq!(err.exception_name(), Some("TypeError"));

        // Never settles without the host.
        assert_eq!(ctx.eval_async("new Promise(() => {})").await.unwrap(), Json::Null);
    }

    #[test]
    fn test_call_passes_json_arguments() {
        let ctx = runtime(1_000).create_context().unwrap();
        ctx.eval("function join(a, b) { return a.x + b; }").unwrap();
        assert_eq!(ctx.call("join", &[json!({"x": "a"}), json!("b")]).unwrap(), json!("ab"));
    }

    #[test]
    fn test_call_keeps_proto_keys_as_data() {
        let ctx = runtime(1_000).create_context().unwrap();
        ctx.eval(
            "function inspect(o) { return [Object.keys(o), Object.getPrototypeOf(o) === Object.prototype, o.polluted === undefined]; }",
        )
        .unwrap();
        let arg = json!({"__proto__": {"polluted": true}});
        assert_eq!(ctx.call("inspect", &[arg]).unwrap(), json!([["__proto__"], true, true]));
    }

    #[test]
    fn test_dispose_cascades_to_contexts() {
        let rt = runtime(1_000);
        let ctx = rt.create_context().unwrap();
        ctx.eval("globalThis.kept = 1").unwrap();

        rt.dispose();
        rt.dispose();
        assert!(rt.is_disposed());
        assert!(ctx.is_disposed());
        assert_eq!(ctx.eval("1"), Err(SandboxError::Disposed));
        assert!(rt.create_context().is_err());
        assert!(rt.memory_usage().is_none());
    }

    #[test]
    fn test_memory_usage_reports_limit() {
        let rt = runtime(1_000);
        let stats = rt.memory_usage().unwrap();
        assert!(stats.used_bytes > 0);
        assert_eq!(stats.limit_bytes, Some(256 * 1024 * 1024));
    }
}
