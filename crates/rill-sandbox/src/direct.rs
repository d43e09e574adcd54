//! Unguarded provider for trusted bundles and debugging.
//!
//! Runs on the same interpreter as [`QuickJsProvider`](crate::QuickJsProvider)
//! but installs neither the interrupt handler nor heap limits. The timeout in
//! [`RuntimeOptions`] is ignored: a runaway loop hangs the host thread.

use tracing::warn;

use crate::errors::SandboxError;
use crate::options::RuntimeOptions;
use crate::quickjs::QuickJsRuntime;

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectProvider;

impl DirectProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn create_runtime(&self, options: RuntimeOptions) -> Result<QuickJsRuntime, SandboxError> {
        warn!(
            target: "rill_sandbox::direct",
            timeout_ms = options.timeout_ms(),
            "using the direct provider: guest code is not interrupted and heap limits are off"
        );
        QuickJsRuntime::new(options, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_direct_runtime_is_unguarded() {
        let rt = DirectProvider::new()
            .create_runtime(RuntimeOptions::default().with_timeout(Duration::from_millis(1)))
            .unwrap();
        assert!(!rt.is_guarded());
        assert_eq!(rt.memory_usage().unwrap().limit_bytes, None);

        // Far longer than the 1ms budget, yet not interrupted.
        let ctx = rt.create_context().unwrap();
        let sum = ctx
            .eval("let s = 0; for (let i = 0; i < 200000; i++) { s += i; } s")
            .unwrap();
        assert_eq!(sum, json!(19999900000u64));
    }
}
