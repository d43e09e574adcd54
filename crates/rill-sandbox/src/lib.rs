//! Isolated JavaScript runtimes for the rill engine.
//!
//! A [`SandboxProvider`] creates [`SandboxRuntime`]s (one interpreter heap
//! each), which create [`SandboxContext`]s (one global scope each). Values
//! cross the boundary as JSON; host functions are installed with
//! [`SandboxContext::define_function`].
//!
//! | provider | timeout | heap limit | on timeout |
//! |----------|---------|------------|------------|
//! | `quickjs` | interrupt | yes | evaluation aborted, context reusable |
//! | `worker` | host-side wait | yes | worker terminated |
//! | `direct` | none | no | never fires |
//!
//! ```no_run
//! use rill_sandbox::{RuntimeOptions, SandboxProvider};
//!
//! let provider = SandboxProvider::detect(None, false)?;
//! let runtime = provider.create_runtime(RuntimeOptions::default())?;
//! let context = runtime.create_context()?;
//! assert_eq!(context.eval("6 * 7")?, serde_json::json!(42));
//! runtime.dispose();
//! # Ok::<(), rill_sandbox::SandboxError>(())
//! ```

mod direct;
mod errors;
mod js;
mod options;
mod provider;
mod quickjs;
mod worker;

pub use direct::DirectProvider;
pub use errors::{NativeError, SandboxError};
pub use options::{native, MemoryStats, NativeFunction, RuntimeOptions};
pub use provider::{
    probe_environment, select_provider, EnvironmentProbe, ProviderKind, SandboxContext,
    SandboxProvider, SandboxRuntime,
};
pub use quickjs::{QuickJsContext, QuickJsProvider, QuickJsRuntime};
pub use worker::{WorkerContext, WorkerProvider, WorkerRuntime};
