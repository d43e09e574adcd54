//! Worker-thread provider.
//!
//! The interpreter lives on a dedicated thread and is driven over a channel.
//! The host waits on each request with the evaluation budget; when a wait
//! expires the worker is terminated and every later request fails with
//! [`SandboxError::Terminated`]. There is no per-evaluation interrupt, so a
//! timeout costs the whole runtime.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use rquickjs::{Context, Runtime};
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::SandboxError;
use crate::js;
use crate::options::{MemoryStats, NativeFunction, RuntimeOptions};

type Reply<T> = Box<dyn FnOnce(Result<T, SandboxError>) + Send>;
type ContextId = u64;

enum Request {
    CreateContext(Reply<ContextId>),
    Eval {
        context: ContextId,
        code: String,
        resolve: bool,
        reply: Reply<Json>,
    },
    SetGlobal {
        context: ContextId,
        name: String,
        value: Json,
        reply: Reply<()>,
    },
    GetGlobal {
        context: ContextId,
        name: String,
        reply: Reply<Json>,
    },
    Define {
        context: ContextId,
        name: String,
        function: NativeFunction,
        reply: Reply<()>,
    },
    DisposeContext {
        context: ContextId,
        reply: Reply<()>,
    },
    MemoryUsage(Reply<MemoryStats>),
}

/// Creates [`WorkerRuntime`]s, one thread each.
#[derive(Debug, Clone)]
pub struct WorkerProvider {
    thread_name: String,
}

impl Default for WorkerProvider {
    fn default() -> Self {
        Self {
            thread_name: "rill-sandbox-worker".to_string(),
        }
    }
}

impl WorkerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn create_runtime(&self, options: RuntimeOptions) -> Result<WorkerRuntime, SandboxError> {
        let (tx, rx) = mpsc::channel::<Request>();
        let terminated = Arc::new(AtomicBool::new(false));

        let worker_terminated = Arc::clone(&terminated);
        let worker_options = options.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), SandboxError>>(1);
        let handle = std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || worker_main(rx, worker_options, worker_terminated, ready_tx))
            .map_err(|e| SandboxError::Unavailable(format!("cannot spawn worker: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SandboxError::Unavailable("worker exited during startup".into())),
        }

        debug!(target: "rill_sandbox::worker", thread = %self.thread_name, "worker runtime started");
        Ok(WorkerRuntime {
            inner: Rc::new(WorkerShared {
                tx: RefCell::new(Some(tx)),
                handle: RefCell::new(Some(handle)),
                terminated,
                options,
                contexts: RefCell::new(Vec::new()),
                disposed: Cell::new(false),
            }),
        })
    }
}

fn worker_main(
    rx: mpsc::Receiver<Request>,
    options: RuntimeOptions,
    terminated: Arc<AtomicBool>,
    ready: mpsc::SyncSender<Result<(), SandboxError>>,
) {
    let rt = match js::new_runtime(&options, true) {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let stop = Arc::clone(&terminated);
    rt.set_interrupt_handler(Some(Box::new(move || stop.load(Ordering::SeqCst))));
    let _ = ready.send(Ok(()));

    let mut worker = Worker {
        rt,
        contexts: HashMap::new(),
        next_id: 1,
        terminated,
    };
    while let Ok(request) = rx.recv() {
        worker.handle(request);
        if worker.is_terminated() {
            break;
        }
    }
    worker.contexts.clear();
    debug!(target: "rill_sandbox::worker", "worker loop exited");
}

struct Worker {
    rt: Runtime,
    contexts: HashMap<ContextId, Context>,
    next_id: ContextId,
    terminated: Arc<AtomicBool>,
}

impl Worker {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn context(&self, id: ContextId) -> Result<&Context, SandboxError> {
        self.contexts.get(&id).ok_or(SandboxError::Disposed)
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::CreateContext(reply) => {
                let result = js::new_context(&self.rt).map(|context| {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.contexts.insert(id, context);
                    id
                });
                reply(result);
            }
            Request::Eval {
                context,
                code,
                resolve,
                reply,
            } => reply(self.eval(context, &code, resolve)),
            Request::SetGlobal {
                context,
                name,
                value,
                reply,
            } => reply(
                self.context(context)
                    .and_then(|c| c.with(|ctx| js::set_global(&ctx, &name, &value))),
            ),
            Request::GetGlobal {
                context,
                name,
                reply,
            } => reply(
                self.context(context)
                    .and_then(|c| c.with(|ctx| js::get_global(&ctx, &name))),
            ),
            Request::Define {
                context,
                name,
                function,
                reply,
            } => reply(
                self.context(context)
                    .and_then(|c| c.with(|ctx| js::install_native(&ctx, &name, function))),
            ),
            Request::DisposeContext { context, reply } => {
                if let Some(context) = self.contexts.remove(&context) {
                    context.with(|ctx| js::clear_globals(&ctx));
                    drop(context);
                    self.rt.run_gc();
                }
                reply(Ok(()));
            }
            Request::MemoryUsage(reply) => {
                let usage = self.rt.memory_usage();
                reply(Ok(MemoryStats {
                    malloc_bytes: usage.malloc_size.max(0) as u64,
                    used_bytes: usage.memory_used_size.max(0) as u64,
                    limit_bytes: None,
                }));
            }
        }
    }

    fn eval(&self, id: ContextId, code: &str, resolve: bool) -> Result<Json, SandboxError> {
        let context = self.context(id)?;
        let terminated = &self.terminated;
        let source = if resolve {
            js::resolving_source(code)
        } else {
            code.to_string()
        };

        let result = context.with(|ctx| js::eval_json(&ctx, &source));
        js::drain_jobs(&self.rt, &|| terminated.load(Ordering::SeqCst));
        if self.is_terminated() {
            return Err(SandboxError::Terminated);
        }
        let value = result?;
        if resolve {
            context.with(|ctx| js::take_resolved(&ctx))
        } else {
            Ok(value)
        }
    }
}

struct WorkerShared {
    tx: RefCell<Option<mpsc::Sender<Request>>>,
    handle: RefCell<Option<JoinHandle<()>>>,
    terminated: Arc<AtomicBool>,
    options: RuntimeOptions,
    contexts: RefCell<Vec<Weak<WorkerContextInner>>>,
    disposed: Cell<bool>,
}

impl WorkerShared {
    fn submit(&self, request: Request) -> Result<(), SandboxError> {
        if self.disposed.get() {
            return Err(SandboxError::Disposed);
        }
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SandboxError::Terminated);
        }
        let tx = self.tx.borrow();
        let tx = tx.as_ref().ok_or(SandboxError::Terminated)?;
        tx.send(request).map_err(|_| SandboxError::Terminated)
    }

    fn timed_out(&self, started: Instant) -> SandboxError {
        warn!(
            target: "rill_sandbox::worker",
            limit_ms = self.options.timeout_ms(),
            "evaluation exceeded its budget; terminating worker"
        );
        self.terminate();
        SandboxError::Timeout {
            limit_ms: self.options.timeout_ms(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Blocking round trip.
    fn request<T: Send + 'static>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, SandboxError> {
        let started = Instant::now();
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(make(Box::new(move |r| {
            let _ = tx.send(r);
        })))?;
        match rx.recv_timeout(self.options.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(self.timed_out(started)),
            Err(RecvTimeoutError::Disconnected) => Err(SandboxError::Terminated),
        }
    }

    /// Round trip that waits without blocking the executor.
    async fn request_async<T: Send + 'static>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, SandboxError> {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.submit(make(Box::new(move |r| {
            let _ = tx.send(r);
        })))?;
        match tokio::time::timeout(self.options.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SandboxError::Terminated),
            Err(_) => Err(self.timed_out(started)),
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        // Dropping the sender ends the worker loop once the current request
        // observes the interrupt.
        self.tx.borrow_mut().take();
        self.handle.borrow_mut().take();
    }
}

/// A runtime on its own thread.
#[derive(Clone)]
pub struct WorkerRuntime {
    inner: Rc<WorkerShared>,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("terminated", &self.is_terminated())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

impl WorkerRuntime {
    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub fn create_context(&self) -> Result<WorkerContext, SandboxError> {
        let id = self.inner.request(Request::CreateContext)?;
        let inner = Rc::new(WorkerContextInner {
            id,
            shared: Rc::clone(&self.inner),
            disposed: Cell::new(false),
        });
        let mut contexts = self.inner.contexts.borrow_mut();
        contexts.retain(|c| c.strong_count() > 0);
        contexts.push(Rc::downgrade(&inner));
        Ok(WorkerContext { inner })
    }

    pub fn memory_usage(&self) -> Option<MemoryStats> {
        self.inner
            .request(Request::MemoryUsage)
            .ok()
            .map(|stats| MemoryStats {
                limit_bytes: self.inner.options.memory_limit.map(|b| b as u64),
                ..stats
            })
    }

    /// Dispose all contexts and stop the worker thread. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.get() {
            return;
        }
        let contexts: Vec<_> = self.inner.contexts.borrow_mut().drain(..).collect();
        for context in contexts.iter().filter_map(Weak::upgrade) {
            context.dispose();
        }
        self.inner.disposed.set(true);

        let tx = self.inner.tx.borrow_mut().take();
        drop(tx);
        let handle = self.inner.handle.borrow_mut().take();
        if let Some(handle) = handle {
            if !self.is_terminated() && handle.join().is_err() {
                warn!(target: "rill_sandbox::worker", "worker thread panicked");
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}

struct WorkerContextInner {
    id: ContextId,
    shared: Rc<WorkerShared>,
    disposed: Cell<bool>,
}

impl WorkerContextInner {
    fn live(&self) -> Result<(), SandboxError> {
        if self.disposed.get() {
            Err(SandboxError::Disposed)
        } else {
            Ok(())
        }
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let id = self.id;
        if let Err(e) = self
            .shared
            .request(|reply| Request::DisposeContext { context: id, reply })
        {
            debug!(target: "rill_sandbox::worker", "context dispose skipped: {}", e);
        }
    }
}

/// A global scope inside a [`WorkerRuntime`].
#[derive(Clone)]
pub struct WorkerContext {
    inner: Rc<WorkerContextInner>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("id", &self.inner.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl WorkerContext {
    pub fn eval(&self, code: &str) -> Result<Json, SandboxError> {
        self.inner.live()?;
        let (context, code) = (self.inner.id, code.to_string());
        self.inner.shared.request(|reply| Request::Eval {
            context,
            code,
            resolve: false,
            reply,
        })
    }

    pub async fn eval_async(&self, code: &str) -> Result<Json, SandboxError> {
        self.inner.live()?;
        let (context, code) = (self.inner.id, code.to_string());
        self.inner
            .shared
            .request_async(|reply| Request::Eval {
                context,
                code,
                resolve: true,
                reply,
            })
            .await
    }

    pub fn set_global(&self, name: &str, value: &Json) -> Result<(), SandboxError> {
        self.inner.live()?;
        let (context, name, value) = (self.inner.id, name.to_string(), value.clone());
        self.inner.shared.request(|reply| Request::SetGlobal {
            context,
            name,
            value,
            reply,
        })
    }

    pub fn get_global(&self, name: &str) -> Result<Json, SandboxError> {
        self.inner.live()?;
        let (context, name) = (self.inner.id, name.to_string());
        self.inner
            .shared
            .request(|reply| Request::GetGlobal { context, name, reply })
    }

    pub fn define_function(&self, name: &str, function: NativeFunction) -> Result<(), SandboxError> {
        self.inner.live()?;
        let (context, name) = (self.inner.id, name.to_string());
        self.inner.shared.request(|reply| Request::Define {
            context,
            name,
            function,
            reply,
        })
    }

    pub fn call(&self, function: &str, args: &[Json]) -> Result<Json, SandboxError> {
        self.eval(&js::call_source(function, args))
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get() || self.inner.shared.disposed.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::native;
    use serde_json::json;
    use std::time::Duration;

    fn runtime(timeout_ms: u64) -> WorkerRuntime {
        WorkerProvider::new()
            .create_runtime(RuntimeOptions::default().with_timeout(Duration::from_millis(timeout_ms)))
            .unwrap()
    }

    #[test]
    fn test_round_trip_on_worker_thread() {
        let rt = runtime(2_000);
        let ctx = rt.create_context().unwrap();
        ctx.set_global("input", &json!([1, 2, 3])).unwrap();
        assert_eq!(ctx.eval("input.reduce((a, b) => a + b, 0)").unwrap(), json!(6));
        assert_eq!(ctx.get_global("input").unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_native_runs_on_worker() {
        let rt = runtime(2_000);
        let ctx = rt.create_context().unwrap();
        let host_thread = std::thread::current().id();
        ctx.define_function(
            "sameThread",
            native(move |_| Ok(json!(std::thread::current().id() == host_thread))),
        )
        .unwrap();
        assert_eq!(ctx.eval("sameThread()").unwrap(), json!(false));
    }

    #[test]
    fn test_timeout_terminates_worker() {
        let rt = runtime(50);
        let ctx = rt.create_context().unwrap();
        let err = ctx.eval("for (;;) {}").unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert!(rt.is_terminated());
        assert_eq!(ctx.eval("1"), Err(SandboxError::Terminated));
    }

    #[test]
    fn test_call_arguments_cannot_reach_the_prototype() {
        let rt = runtime(2_000);
        let ctx = rt.create_context().unwrap();
        ctx.eval("function polluted(o) { return ({}).polluted === true || o.polluted === true; }")
            .unwrap();
        let arg = json!({"__proto__": {"polluted": true}});
        assert_eq!(ctx.call("polluted", &[arg]).unwrap(), json!(false));
    }

    #[tokio::test]
    async fn test_eval_async_does_not_block() {
        let rt = runtime(2_000);
        let ctx = rt.create_context().unwrap();
        assert_eq!(ctx.eval_async("Promise.resolve('ok')").await.unwrap(), json!("ok"));
    }

    #[test]
    fn test_dispose_joins_worker() {
        let rt = runtime(2_000);
        let ctx = rt.create_context().unwrap();
        rt.dispose();
        rt.dispose();
        assert!(ctx.is_disposed());
        assert_eq!(ctx.eval("1"), Err(SandboxError::Disposed));
        assert!(rt.memory_usage().is_none());
    }
}
