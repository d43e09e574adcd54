//! The closed set of providers and environment-based selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

use crate::direct::DirectProvider;
use crate::errors::SandboxError;
use crate::options::{MemoryStats, NativeFunction, RuntimeOptions};
use crate::quickjs::{QuickJsContext, QuickJsProvider, QuickJsRuntime};
use crate::worker::{WorkerContext, WorkerProvider, WorkerRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process interpreter with a hard interrupt.
    QuickJs,
    /// Interpreter on a dedicated thread, terminated on timeout.
    Worker,
    /// No interrupt and no heap limits.
    Direct,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::QuickJs => "quickjs",
            ProviderKind::Worker => "worker",
            ProviderKind::Direct => "direct",
        }
    }

    /// Whether a single runaway evaluation can be stopped.
    pub fn supports_timeout(&self) -> bool {
        !matches!(self, ProviderKind::Direct)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quickjs" | "qjs" => Ok(ProviderKind::QuickJs),
            "worker" | "thread" => Ok(ProviderKind::Worker),
            "direct" | "none" => Ok(ProviderKind::Direct),
            other => Err(format!(
                "unknown sandbox provider '{}' (expected quickjs, worker or direct)",
                other
            )),
        }
    }
}

/// What the host environment can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentProbe {
    /// An interpreter heap can be created.
    pub interpreter: bool,
    /// The interpreter honours interrupt callbacks.
    pub interrupt: bool,
    /// Threads can be spawned.
    pub threads: bool,
}

impl EnvironmentProbe {
    pub fn supports(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::QuickJs => self.interpreter && self.interrupt,
            ProviderKind::Worker => self.interpreter && self.threads,
            ProviderKind::Direct => self.interpreter,
        }
    }
}

pub fn probe_environment() -> EnvironmentProbe {
    let interpreter = rquickjs::Runtime::new()
        .and_then(|rt| rquickjs::Context::base(&rt).map(|_| ()))
        .is_ok();
    let threads = std::thread::Builder::new()
        .name("rill-probe".into())
        .spawn(|| ())
        .map(|handle| handle.join().is_ok())
        .unwrap_or(false);
    EnvironmentProbe {
        interpreter,
        // rquickjs always exposes the interrupt hook.
        interrupt: interpreter,
        threads,
    }
}

/// Pick a provider.
///
/// An explicit choice wins when the environment supports it. Otherwise the
/// in-process interpreter is preferred, then the worker; the unguarded
/// provider is only chosen when `allow_unsafe_fallback` is set.
pub fn select_provider(
    explicit: Option<ProviderKind>,
    probe: &EnvironmentProbe,
    allow_unsafe_fallback: bool,
) -> Result<ProviderKind, SandboxError> {
    if let Some(kind) = explicit {
        if !probe.supports(kind) {
            return Err(SandboxError::Unavailable(format!(
                "provider '{}' is not supported here",
                kind
            )));
        }
        return Ok(kind);
    }

    if probe.supports(ProviderKind::QuickJs) {
        return Ok(ProviderKind::QuickJs);
    }
    if probe.supports(ProviderKind::Worker) {
        return Ok(ProviderKind::Worker);
    }
    if allow_unsafe_fallback && probe.supports(ProviderKind::Direct) {
        warn!(
            target: "rill_sandbox::provider",
            "no isolating provider available; falling back to direct execution"
        );
        return Ok(ProviderKind::Direct);
    }
    Err(SandboxError::Unavailable(
        "no isolating provider available and unsafe fallback is disabled".into(),
    ))
}

/// Factory for runtimes.
#[derive(Debug, Clone)]
pub enum SandboxProvider {
    QuickJs(QuickJsProvider),
    Worker(WorkerProvider),
    Direct(DirectProvider),
}

impl SandboxProvider {
    pub fn from_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::QuickJs => SandboxProvider::QuickJs(QuickJsProvider::new()),
            ProviderKind::Worker => SandboxProvider::Worker(WorkerProvider::new()),
            ProviderKind::Direct => SandboxProvider::Direct(DirectProvider::new()),
        }
    }

    /// Probe the environment and pick a provider.
    pub fn detect(
        explicit: Option<ProviderKind>,
        allow_unsafe_fallback: bool,
    ) -> Result<Self, SandboxError> {
        let probe = probe_environment();
        let kind = select_provider(explicit, &probe, allow_unsafe_fallback)?;
        info!(target: "rill_sandbox::provider", provider = %kind, "selected sandbox provider");
        Ok(Self::from_kind(kind))
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            SandboxProvider::QuickJs(_) => ProviderKind::QuickJs,
            SandboxProvider::Worker(_) => ProviderKind::Worker,
            SandboxProvider::Direct(_) => ProviderKind::Direct,
        }
    }

    /// Whether this provider can run in the current environment.
    pub fn is_available(&self) -> bool {
        probe_environment().supports(self.kind())
    }

    pub fn supports_interrupt(&self) -> bool {
        matches!(self, SandboxProvider::QuickJs(_))
    }

    pub fn create_runtime(&self, options: RuntimeOptions) -> Result<SandboxRuntime, SandboxError> {
        match self {
            SandboxProvider::QuickJs(p) => p.create_runtime(options).map(SandboxRuntime::QuickJs),
            SandboxProvider::Worker(p) => p.create_runtime(options).map(SandboxRuntime::Worker),
            SandboxProvider::Direct(p) => p.create_runtime(options).map(SandboxRuntime::Direct),
        }
    }
}

impl Default for SandboxProvider {
    fn default() -> Self {
        SandboxProvider::QuickJs(QuickJsProvider::new())
    }
}

/// An interpreter heap from one of the providers.
#[derive(Debug, Clone)]
pub enum SandboxRuntime {
    QuickJs(QuickJsRuntime),
    Worker(WorkerRuntime),
    Direct(QuickJsRuntime),
}

impl SandboxRuntime {
    pub fn kind(&self) -> ProviderKind {
        match self {
            SandboxRuntime::QuickJs(_) => ProviderKind::QuickJs,
            SandboxRuntime::Worker(_) => ProviderKind::Worker,
            SandboxRuntime::Direct(_) => ProviderKind::Direct,
        }
    }

    pub fn create_context(&self) -> Result<SandboxContext, SandboxError> {
        match self {
            SandboxRuntime::QuickJs(rt) => rt.create_context().map(SandboxContext::QuickJs),
            SandboxRuntime::Worker(rt) => rt.create_context().map(SandboxContext::Worker),
            SandboxRuntime::Direct(rt) => rt.create_context().map(SandboxContext::Direct),
        }
    }

    pub fn memory_usage(&self) -> Option<MemoryStats> {
        match self {
            SandboxRuntime::QuickJs(rt) | SandboxRuntime::Direct(rt) => rt.memory_usage(),
            SandboxRuntime::Worker(rt) => rt.memory_usage(),
        }
    }

    pub fn dispose(&self) {
        match self {
            SandboxRuntime::QuickJs(rt) | SandboxRuntime::Direct(rt) => rt.dispose(),
            SandboxRuntime::Worker(rt) => rt.dispose(),
        }
    }

    /// True once disposed, or once a worker was terminated after a timeout.
    pub fn is_disposed(&self) -> bool {
        match self {
            SandboxRuntime::QuickJs(rt) | SandboxRuntime::Direct(rt) => rt.is_disposed(),
            SandboxRuntime::Worker(rt) => rt.is_disposed() || rt.is_terminated(),
        }
    }
}

/// A global scope in which guest code runs.
#[derive(Debug, Clone)]
pub enum SandboxContext {
    QuickJs(QuickJsContext),
    Worker(WorkerContext),
    Direct(QuickJsContext),
}

macro_rules! dispatch {
    ($self:expr, $ctx:ident => $body:expr) => {
        match $self {
            SandboxContext::QuickJs($ctx) | SandboxContext::Direct($ctx) => $body,
            SandboxContext::Worker($ctx) => $body,
        }
    };
}

impl SandboxContext {
    pub fn kind(&self) -> ProviderKind {
        match self {
            SandboxContext::QuickJs(_) => ProviderKind::QuickJs,
            SandboxContext::Worker(_) => ProviderKind::Worker,
            SandboxContext::Direct(_) => ProviderKind::Direct,
        }
    }

    pub fn eval(&self, code: &str) -> Result<Json, SandboxError> {
        dispatch!(self, ctx => ctx.eval(code))
    }

    pub async fn eval_async(&self, code: &str) -> Result<Json, SandboxError> {
        dispatch!(self, ctx => ctx.eval_async(code).await)
    }

    pub fn set_global(&self, name: &str, value: &Json) -> Result<(), SandboxError> {
        dispatch!(self, ctx => ctx.set_global(name, value))
    }

    pub fn get_global(&self, name: &str) -> Result<Json, SandboxError> {
        dispatch!(self, ctx => ctx.get_global(name))
    }

    pub fn define_function(&self, name: &str, f: NativeFunction) -> Result<(), SandboxError> {
        dispatch!(self, ctx => ctx.define_function(name, f))
    }

    pub fn call(&self, function: &str, args: &[Json]) -> Result<Json, SandboxError> {
        dispatch!(self, ctx => ctx.call(function, args))
    }

    pub fn dispose(&self) {
        dispatch!(self, ctx => ctx.dispose())
    }

    pub fn is_disposed(&self) -> bool {
        dispatch!(self, ctx => ctx.is_disposed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: EnvironmentProbe = EnvironmentProbe {
        interpreter: true,
        interrupt: true,
        threads: true,
    };

    #[test]
    fn test_kind_parsing() {
        assert_eq!("quickjs".parse::<ProviderKind>(), Ok(ProviderKind::QuickJs));
        assert_eq!("Worker".parse::<ProviderKind>(), Ok(ProviderKind::Worker));
        assert_eq!("direct".parse::<ProviderKind>(), Ok(ProviderKind::Direct));
        assert!("v8".parse::<ProviderKind>().is_err());
        assert_eq!(
            serde_json::to_string(&ProviderKind::QuickJs).unwrap(),
            "\"quickjs\""
        );
    }

    #[test]
    fn test_selection_prefers_interrupt() {
        assert_eq!(select_provider(None, &FULL, false), Ok(ProviderKind::QuickJs));

        let no_interrupt = EnvironmentProbe {
            interrupt: false,
            ..FULL
        };
        assert_eq!(
            select_provider(None, &no_interrupt, false),
            Ok(ProviderKind::Worker)
        );
    }

    #[test]
    fn test_unsafe_fallback_requires_opt_in() {
        let bare = EnvironmentProbe {
            interpreter: true,
            interrupt: false,
            threads: false,
        };
        assert!(select_provider(None, &bare, false).is_err());
        assert_eq!(select_provider(None, &bare, true), Ok(ProviderKind::Direct));
    }

    #[test]
    fn test_explicit_choice_wins_when_supported() {
        assert_eq!(
            select_provider(Some(ProviderKind::Direct), &FULL, false),
            Ok(ProviderKind::Direct)
        );
        let no_threads = EnvironmentProbe {
            threads: false,
            ..FULL
        };
        assert!(matches!(
            select_provider(Some(ProviderKind::Worker), &no_threads, false),
            Err(SandboxError::Unavailable(_))
        ));
    }

    #[test]
    fn test_probe_finds_interpreter() {
        let probe = probe_environment();
        assert!(probe.interpreter);
        assert!(probe.supports(ProviderKind::QuickJs));
    }

    #[test]
    fn test_every_provider_evaluates() {
        for kind in [ProviderKind::QuickJs, ProviderKind::Worker, ProviderKind::Direct] {
            let provider = SandboxProvider::from_kind(kind);
            let rt = provider.create_runtime(RuntimeOptions::default()).unwrap();
            let ctx = rt.create_context().unwrap();
            assert_eq!(ctx.kind(), kind);
            assert_eq!(ctx.eval("[1, 2].length").unwrap(), serde_json::json!(2));
            rt.dispose();
            assert!(ctx.is_disposed());
        }
    }
}
