//! The host's entry point: one engine per guest lifetime.
//!
//! ```text
//! idle -> initializing -> loaded -> destroyed
//!              |             ^
//!              v             |
//!            error ----------+   (next successful load_bundle)
//! ```
//!
//! The engine owns a sandbox runtime, creates a fresh context for every
//! `load_bundle`, injects the guest runtime and wires a [`Bridge`] between
//! the sandbox and the active [`Receiver`].
//!
//! Guest natives only touch [`GuestState`] behind a mutex (they may run on a
//! worker thread). Messages the guest posts pile up in its outbox and are
//! pumped into the bridge on the host thread; messages for the guest queue up
//! and are delivered one `__rill_receive` call at a time, each checked
//! against the engine state first.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rill_protocol::{ActivitySnapshot, ActivityTimeline, OperationCollector, OperationMerger, Receiver};
use rill_sandbox::{
    native, NativeError, ProviderKind, SandboxContext, SandboxError, SandboxProvider, SandboxRuntime,
};
use rill_types::{BridgeMessage, ErrorValue, Operation, Value};
use serde_json::{json, Value as Json};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::bridge::Bridge;
use crate::config::{EngineConfig, EngineOptions, GuestLogger, MetricCallback};
use crate::errors::{EngineError, UNSUPPORTED_REQUIRE};
use crate::events::{EngineEvent, EngineEventKind, Events, Subscription};
use crate::health::{EngineDiagnostics, EngineHealth, EngineState, HealthTracker};

/// Injected into every fresh context before the bundle.
pub const GUEST_RUNTIME: &str = include_str!("guest/runtime.js");

const RECEIVE_FN: &str = "__rill_receive";

/// State shared with the guest natives.
struct GuestState {
    collector: OperationCollector,
    merge: bool,
    outbox: VecDeque<Json>,
    whitelist: Vec<String>,
    /// First require outside the whitelist in this session.
    violation: Option<String>,
    errors: Vec<EngineError>,
}

impl GuestState {
    fn new(config: &EngineConfig) -> Self {
        Self {
            collector: new_collector(config.merge_operations),
            merge: config.merge_operations,
            outbox: VecDeque::new(),
            whitelist: config.require_whitelist.clone(),
            violation: None,
            errors: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.collector = new_collector(self.merge);
        self.outbox.clear();
        self.violation = None;
        self.errors.clear();
    }
}

fn new_collector(merge: bool) -> OperationCollector {
    if merge {
        OperationCollector::new().with_merger(OperationMerger::new())
    } else {
        OperationCollector::new()
    }
}

/// Sandboxed guest engine.
///
/// Not `Send`: drive it from one thread (a current-thread runtime or a
/// `LocalSet` for the async parts).
pub struct Engine {
    inner: Rc<EngineInner>,
}

struct EngineInner {
    id: String,
    config: EngineConfig,
    provider: SandboxProvider,
    logger: Option<Arc<dyn GuestLogger>>,
    on_metric: Option<MetricCallback>,
    state: Cell<EngineState>,
    health: RefCell<HealthTracker>,
    events: Events,
    runtime: RefCell<Option<SandboxRuntime>>,
    context: RefCell<Option<SandboxContext>>,
    guest: Arc<Mutex<GuestState>>,
    bridge: Bridge,
    receiver: RefCell<Option<Rc<RefCell<Receiver>>>>,
    to_guest: Rc<RefCell<VecDeque<Json>>>,
    pumping: Cell<bool>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("provider", &self.inner.provider.kind())
            .field("state", &self.inner.state.get())
            .field("handlers", &self.inner.events.handler_count())
            .finish()
    }
}

impl Engine {
    /// Build an engine. The sandbox provider is the explicit one, or the best
    /// one this environment supports; the runtime itself is created lazily.
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        let EngineOptions {
            config,
            provider,
            logger,
            on_metric,
        } = options;
        if config.receiver_max_batch_size == 0 {
            return Err(EngineError::Config("receiverMaxBatchSize must be at least 1".into()));
        }
        if config.diagnostics.activity_bucket_ms <= 0 {
            return Err(EngineError::Config("diagnostics.activityBucketMs must be positive".into()));
        }
        let provider = match provider {
            Some(provider) => provider,
            None => SandboxProvider::detect(config.provider, config.allow_unsafe_fallback)?,
        };
        if !provider.supports_interrupt() {
            warn!(
                target: "rill::engine",
                provider = %provider.kind(),
                timeout_ms = config.timeout_ms,
                "provider cannot interrupt guest code; the timeout is informational"
            );
        }

        let guest = Arc::new(Mutex::new(GuestState::new(&config)));
        let to_guest = Rc::new(RefCell::new(VecDeque::new()));
        let id = Uuid::new_v4().to_string();

        let inner = Rc::new_cyclic(|this: &Weak<EngineInner>| {
            let queue = to_guest.clone();
            let pump_target = this.clone();
            let host_target = this.clone();
            let bridge = Bridge::new(
                config.max_reorder_window,
                move |msg| {
                    queue.borrow_mut().push_back(msg);
                    if let Some(engine) = pump_target.upgrade() {
                        engine.pump();
                    }
                },
                move |msg| {
                    if let Some(engine) = host_target.upgrade() {
                        engine.deliver_to_host(msg);
                    }
                },
            );
            EngineInner {
                id,
                config,
                provider,
                logger,
                on_metric,
                state: Cell::new(EngineState::Idle),
                health: RefCell::new(HealthTracker::default()),
                events: Events::default(),
                runtime: RefCell::new(None),
                context: RefCell::new(None),
                guest,
                bridge,
                receiver: RefCell::new(None),
                to_guest,
                pumping: Cell::new(false),
            }
        });
        debug!(target: "rill::engine", engine = %inner.id, provider = %inner.provider.kind(), "engine created");
        Ok(Self { inner })
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        Self::new(EngineOptions::new(config))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.inner.provider.kind()
    }

    pub fn state(&self) -> EngineState {
        self.inner.state.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Run a bundle in a fresh context.
    ///
    /// Rejects with the load-time failure (also reported as an `error`
    /// event). The engine stays usable for another `load_bundle` afterwards.
    pub async fn load_bundle(&self, code: &str, initial_props: Option<Value>) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let started = Instant::now();
        inner.state.set(EngineState::Initializing);
        info!(target: "rill::engine", engine = %inner.id, bytes = code.len(), "loading bundle");

        let result = inner.load(code, initial_props).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if inner.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        match result {
            Ok(()) => {
                inner.state.set(EngineState::Loaded);
                info!(target: "rill::engine", engine = %inner.id, elapsed_ms, "bundle loaded");
                inner.metric("engine.load_bundle", elapsed_ms, Some(&json!({ "ok": true })));
                Ok(())
            }
            Err(err) => {
                inner.state.set(EngineState::Error);
                inner.teardown_context();
                if err.is_timeout() {
                    inner.teardown_runtime();
                }
                inner.metric(
                    "engine.load_bundle",
                    elapsed_ms,
                    Some(&json!({ "ok": false, "error": err.kind() })),
                );
                inner.record_error(err.clone());
                Err(err)
            }
        }
    }

    /// Attach a new receiver for the guest's operations. Replaces and
    /// detaches the previous one.
    pub fn create_receiver(
        &self,
        on_update: impl FnMut(&Receiver) + 'static,
    ) -> Result<Rc<RefCell<Receiver>>, EngineError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let diagnostics = &inner.config.diagnostics;
        let bridge = inner.bridge.clone();
        let receiver = Receiver::new(inner.config.receiver_max_batch_size)
            .with_timeline(ActivityTimeline::new(
                diagnostics.activity_history_ms,
                diagnostics.activity_bucket_ms,
            ))
            .with_sender(move |msg| bridge.send_to_guest(msg))
            .with_on_update(on_update);
        let receiver = Rc::new(RefCell::new(receiver));

        let previous = inner.receiver.replace(Some(receiver.clone()));
        if let Some(previous) = previous {
            previous.borrow_mut().detach();
            debug!(target: "rill::engine", engine = %inner.id, "replaced receiver");
        }
        Ok(receiver)
    }

    pub fn receiver(&self) -> Option<Rc<RefCell<Receiver>>> {
        self.inner.receiver.borrow().clone()
    }

    /// Deliver a `HOST_EVENT` to the guest's `Rill.onEvent` handlers.
    pub fn send_event(&self, event_name: &str, payload: Value) -> Result<(), EngineError> {
        self.send_to_sandbox(BridgeMessage::host_event(event_name, payload))
    }

    /// Send `CONFIG_UPDATE`; the guest merges `props` into `Rill.getProps()`.
    pub fn update_config(&self, props: Value) -> Result<(), EngineError> {
        self.send_to_sandbox(BridgeMessage::ConfigUpdate { props })
    }

    /// Encode and deliver any host-to-guest message, then run the exchange
    /// until both sides are idle.
    pub fn send_to_sandbox(&self, msg: BridgeMessage<Value>) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        inner.live_context()?;
        inner.bridge.send_to_guest(msg);
        inner.pump();
        Ok(())
    }

    /// Evaluate code in the current context. Debug mode only.
    pub fn eval(&self, code: &str) -> Result<Json, EngineError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        if !inner.config.debug {
            return Err(EngineError::InvalidState("eval is only available in debug mode".into()));
        }
        let context = inner.live_context()?;
        let started = Instant::now();
        let result = context.eval(code);
        inner.metric("engine.eval", started.elapsed().as_secs_f64() * 1000.0, None);
        inner.pump();
        result.map_err(EngineError::from)
    }

    /// Functions the guest currently exposes to the host.
    pub fn guest_callback_count(&self) -> Result<usize, EngineError> {
        let inner = &self.inner;
        inner.ensure_alive()?;
        let count = inner.live_context()?.eval("__rill_callback_count()")?;
        Ok(count.as_u64().unwrap_or(0) as usize)
    }

    /// Host functions currently exposed to the guest.
    pub fn host_callback_count(&self) -> usize {
        self.inner.bridge.callback_count()
    }

    pub fn on(&self, kind: EngineEventKind, handler: impl Fn(&EngineEvent) + 'static) -> Subscription {
        self.inner.events.on(kind, handler)
    }

    pub fn get_health(&self) -> EngineHealth {
        let inner = &self.inner;
        let health = inner.health.borrow();
        let state = inner.state.get();
        EngineHealth {
            loaded: state == EngineState::Loaded,
            destroyed: state == EngineState::Destroyed,
            error_count: health.error_count(),
            last_error_at: health.last_error_at(),
            receiver_nodes: inner.receiver_nodes(),
            state,
        }
    }

    pub fn get_diagnostics(&self) -> EngineDiagnostics {
        let inner = &self.inner;
        let receiver = inner.receiver.borrow().clone();
        let (activity, stats) = match receiver.as_ref().and_then(|r| r.try_borrow().ok()) {
            Some(r) => (r.activity(), Some(r.stats())),
            None => (
                ActivitySnapshot {
                    bucket_ms: inner.config.diagnostics.activity_bucket_ms,
                    points: Vec::new(),
                },
                None,
            ),
        };
        let memory = inner
            .runtime
            .borrow()
            .as_ref()
            .filter(|rt| !rt.is_disposed())
            .and_then(SandboxRuntime::memory_usage);
        EngineDiagnostics {
            engine_id: inner.id.clone(),
            provider: Some(inner.provider.kind()),
            health: self.get_health(),
            activity,
            receiver: stats,
            memory,
            host_callbacks: inner.bridge.callback_count(),
            pending_promises: inner.bridge.pending_promises(),
            pending_calls: inner.bridge.pending_calls(),
        }
    }

    /// Tear down the sandbox. Terminal: every later call fails with
    /// [`EngineError::Destroyed`]. Repeated calls are ignored.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.is_destroyed() {
            return;
        }
        if inner.live_context().is_ok() {
            inner.bridge.send_to_guest(BridgeMessage::Destroy);
        }
        inner.state.set(EngineState::Destroyed);
        inner.bridge.destroy();
        inner.to_guest.borrow_mut().clear();
        inner.guest.lock().reset();
        inner.teardown_context();
        inner.teardown_runtime();
        let receiver = inner.receiver.borrow().clone();
        if let Some(receiver) = receiver {
            if let Ok(mut receiver) = receiver.try_borrow_mut() {
                receiver.detach();
            }
        }
        info!(target: "rill::engine", engine = %inner.id, "engine destroyed");
        inner.events.emit(&EngineEvent::Destroy);
        inner.events.clear();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 && !self.inner.is_destroyed() {
            self.inner.teardown_context();
            self.inner.teardown_runtime();
        }
    }
}

impl EngineInner {
    fn is_destroyed(&self) -> bool {
        self.state.get() == EngineState::Destroyed
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.is_destroyed() {
            Err(EngineError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn live_context(&self) -> Result<SandboxContext, EngineError> {
        self.context
            .borrow()
            .as_ref()
            .filter(|c| !c.is_disposed())
            .cloned()
            .ok_or_else(|| EngineError::InvalidState("no bundle is loaded".into()))
    }

    async fn load(&self, code: &str, initial_props: Option<Value>) -> Result<(), EngineError> {
        self.teardown_context();
        self.reset_session();

        let runtime = self.ensure_runtime()?;
        let context = runtime.create_context()?;
        *self.context.borrow_mut() = Some(context.clone());
        self.install_natives(&context)?;
        context.eval(GUEST_RUNTIME)?;

        let load = format!("__rill_load({})", Json::from(code));
        let loaded = context.eval_async(&load).await;
        self.check_load(loaded)?;

        let props = initial_props
            .map(|p| self.bridge.encode(&p))
            .unwrap_or_else(|| json!({}));
        let started = context.eval_async(&format!("__rill_start({props})")).await;
        self.check_load(started)?;

        self.pump();
        Ok(())
    }

    /// A recorded whitelist violation outranks whatever the guest did with
    /// the error, including swallowing it.
    fn check_load(&self, result: Result<Json, SandboxError>) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let violation = self.guest.lock().violation.clone();
        match (result, violation) {
            (Err(err), violation) => Err(EngineError::from_sandbox(err, violation)),
            (Ok(_), Some(module)) => Err(EngineError::UnsupportedRequire { module }),
            (Ok(_), None) => Ok(()),
        }
    }

    fn ensure_runtime(&self) -> Result<SandboxRuntime, EngineError> {
        if let Some(runtime) = self.runtime.borrow().as_ref().filter(|rt| !rt.is_disposed()) {
            return Ok(runtime.clone());
        }
        let runtime = self.provider.create_runtime(self.config.runtime_options())?;
        debug!(target: "rill::engine", engine = %self.id, provider = %runtime.kind(), "created sandbox runtime");
        *self.runtime.borrow_mut() = Some(runtime.clone());
        Ok(runtime)
    }

    fn reset_session(&self) {
        self.guest.lock().reset();
        self.to_guest.borrow_mut().clear();
        self.bridge
            .reset_session(&ErrorValue::new("SessionEndedError", "the guest session was replaced"));
        let receiver = self.receiver.borrow().clone();
        if let Some(receiver) = receiver {
            receiver.borrow_mut().clear();
        }
    }

    fn teardown_context(&self) {
        let context = self.context.borrow_mut().take();
        if let Some(context) = context {
            context.dispose();
            trace!(target: "rill::engine", engine = %self.id, "context disposed");
        }
    }

    fn teardown_runtime(&self) {
        let runtime = self.runtime.borrow_mut().take();
        if let Some(runtime) = runtime {
            runtime.dispose();
            debug!(target: "rill::engine", engine = %self.id, "runtime disposed");
        }
    }

    fn install_natives(&self, context: &SandboxContext) -> Result<(), SandboxError> {
        let guest = self.guest.clone();
        context.define_function(
            "__rill_op",
            native(move |args| {
                let op: Operation = serde_json::from_value(first_arg(args))
                    .map_err(|e| NativeError::type_error(format!("malformed operation: {e}")))?;
                guest.lock().collector.push(op);
                Ok(Json::Null)
            }),
        )?;

        let guest = self.guest.clone();
        context.define_function(
            "__rill_flush",
            native(move |_| {
                let mut state = guest.lock();
                let mut flushed = None;
                state.collector.flush(|batch| flushed = Some(batch));
                let Some(batch) = flushed else {
                    return Ok(Json::Null);
                };
                let batch_id = batch.batch_id;
                let msg = serde_json::to_value(BridgeMessage::Operations(batch))
                    .map_err(|e| NativeError::new("InternalError", e.to_string()))?;
                state.outbox.push_back(msg);
                Ok(Json::from(batch_id))
            }),
        )?;

        let guest = self.guest.clone();
        context.define_function(
            "__rill_post",
            native(move |args| {
                guest.lock().outbox.push_back(first_arg(args));
                Ok(Json::Null)
            }),
        )?;

        let guest = self.guest.clone();
        context.define_function(
            "__rill_require",
            native(move |args| {
                let module = first_arg(args).as_str().unwrap_or_default().to_string();
                let mut state = guest.lock();
                if state.whitelist.iter().any(|m| *m == module) {
                    return Ok(Json::Bool(true));
                }
                warn!(target: "rill::engine", module = %module, "require outside the whitelist");
                state.violation.get_or_insert_with(|| module.clone());
                Err(NativeError::new(
                    UNSUPPORTED_REQUIRE,
                    format!("Unsupported require: '{module}'"),
                ))
            }),
        )?;

        let guest = self.guest.clone();
        context.define_function(
            "__rill_report_error",
            native(move |args| {
                let err = first_arg(args);
                guest.lock().errors.push(EngineError::Execution {
                    name: err["name"].as_str().unwrap_or("Error").to_string(),
                    message: err["message"].as_str().unwrap_or_default().to_string(),
                    stack: err["stack"].as_str().map(str::to_string),
                });
                Ok(Json::Null)
            }),
        )?;

        let logger = self.logger.clone();
        let verbose = self.config.debug;
        context.define_function(
            "__rill_log",
            native(move |args| {
                let level = args.first().and_then(Json::as_str).unwrap_or("log");
                let message = args.get(1).and_then(Json::as_str).unwrap_or_default();
                match level {
                    "error" => {
                        error!(target: "rill::guest", "{}", message);
                        if let Some(logger) = &logger {
                            logger.error(message);
                        }
                    }
                    "warn" => {
                        warn!(target: "rill::guest", "{}", message);
                        if let Some(logger) = &logger {
                            logger.warn(message);
                        }
                    }
                    "debug" => {
                        debug!(target: "rill::guest", "{}", message);
                        if let Some(logger) = logger.as_ref().filter(|_| verbose) {
                            logger.log(message);
                        }
                    }
                    _ => {
                        info!(target: "rill::guest", "{}", message);
                        if let Some(logger) = &logger {
                            logger.log(message);
                        }
                    }
                }
                Ok(Json::Null)
            }),
        )
    }

    /// Run the exchange until neither side has anything queued. Re-entrant
    /// calls return immediately; the outer loop picks their work up.
    fn pump(&self) {
        if self.pumping.replace(true) {
            return;
        }
        loop {
            let inbound: Vec<Json> = self.guest.lock().outbox.drain(..).collect();
            let mut progressed = !inbound.is_empty();
            for msg in inbound {
                if let Err(err) = self.bridge.receive_from_guest(msg) {
                    warn!(target: "rill::engine", engine = %self.id, %err, "dropping guest message");
                }
            }
            self.drain_guest_errors();
            progressed |= self.bridge.flush_releases();

            let next = self.to_guest.borrow_mut().pop_front();
            if let Some(msg) = next {
                progressed = true;
                self.deliver_to_guest(msg);
            }
            if !progressed {
                break;
            }
        }
        self.pumping.set(false);
    }

    fn deliver_to_guest(&self, msg: Json) {
        if self.is_destroyed() {
            trace!(target: "rill::engine", "engine destroyed, dropping message for guest");
            return;
        }
        let Ok(context) = self.live_context() else {
            debug!(target: "rill::engine", kind = ?msg.get("type"), "no live context, dropping message for guest");
            return;
        };
        if let Err(err) = context.call(RECEIVE_FN, std::slice::from_ref(&msg)) {
            let timed_out = err.is_timeout();
            self.record_error(err.into());
            if timed_out {
                self.state.set(EngineState::Error);
                self.teardown_context();
                self.teardown_runtime();
            }
        }
    }

    fn deliver_to_host(&self, msg: BridgeMessage<Value>) {
        match msg {
            BridgeMessage::Operations(batch) => {
                let receiver = self.receiver.borrow().clone();
                let Some(receiver) = receiver else {
                    debug!(target: "rill::engine", batch_id = batch.batch_id, "no receiver attached, dropping batch");
                    return;
                };
                let Ok(mut receiver) = receiver.try_borrow_mut() else {
                    warn!(target: "rill::engine", batch_id = batch.batch_id, "receiver is busy, dropping batch");
                    return;
                };
                let outcome = receiver.apply_batch(batch);
                drop(receiver);
                self.metric(
                    "receiver.apply_batch",
                    outcome.duration_ms,
                    Some(&json!({
                        "batchId": outcome.batch_id,
                        "applied": outcome.applied,
                        "skipped": outcome.skipped,
                        "rejected": outcome.rejected,
                    })),
                );
            }
            BridgeMessage::GuestEvent {
                event_name,
                payload,
            } => self.events.emit(&EngineEvent::Message {
                event_name,
                payload,
            }),
            other => trace!(target: "rill::engine", kind = other.message_type(), "ignoring host-bound message"),
        }
    }

    fn drain_guest_errors(&self) {
        let errors = std::mem::take(&mut self.guest.lock().errors);
        for err in errors {
            self.record_error(err);
        }
    }

    fn record_error(&self, err: EngineError) {
        self.health.borrow_mut().record_error();
        warn!(target: "rill::engine", engine = %self.id, kind = err.kind(), "{}", err);
        self.events.emit(&EngineEvent::Error(err));
    }

    fn receiver_nodes(&self) -> usize {
        self.receiver
            .borrow()
            .as_ref()
            .and_then(|r| r.try_borrow().ok().map(|r| r.node_count()))
            .unwrap_or(0)
    }

    fn metric(&self, name: &str, value_ms: f64, extra: Option<&Json>) {
        if let Some(on_metric) = &self.on_metric {
            on_metric(name, value_ms, extra);
        }
    }
}

fn first_arg(args: Vec<Json>) -> Json {
    args.into_iter().next().unwrap_or(Json::Null)
}
