//! Engine configuration.
//!
//! [`EngineConfig`] is the serializable part (JSON file, `RILL_*` env vars);
//! [`EngineOptions`] adds the runtime pieces that cannot be serialized: an
//! explicit sandbox provider, a guest logger and a metric callback.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rill_sandbox::{ProviderKind, RuntimeOptions, SandboxProvider};
use rill_types::env_utils::{env_bool_or, env_list, env_var};
use serde::{Deserialize, Serialize};

/// Modules a bundle may `require` unless configured otherwise.
pub const DEFAULT_REQUIRE_WHITELIST: [&str; 2] = ["rill", "rill/sdk"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagnosticsConfig {
    pub activity_history_ms: i64,
    pub activity_bucket_ms: i64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            activity_history_ms: 60_000,
            activity_bucket_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Explicit provider; `None` probes the environment.
    pub provider: Option<ProviderKind>,
    /// Budget for bundle execution and each delivery into the guest.
    pub timeout_ms: u64,
    /// Enables `Engine::eval` and verbose guest logging.
    pub debug: bool,
    pub require_whitelist: Vec<String>,
    pub receiver_max_batch_size: usize,
    pub diagnostics: DiagnosticsConfig,
    pub memory_limit_bytes: Option<usize>,
    pub max_stack_size_bytes: Option<usize>,
    /// Collapse same-key operations before a batch leaves the guest.
    pub merge_operations: bool,
    /// Batches buffered behind a missing id before the gap is skipped.
    pub max_reorder_window: usize,
    /// Permit the unguarded provider when nothing isolating is available.
    pub allow_unsafe_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: None,
            timeout_ms: 30_000,
            debug: false,
            require_whitelist: DEFAULT_REQUIRE_WHITELIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            receiver_max_batch_size: 5_000,
            diagnostics: DiagnosticsConfig::default(),
            memory_limit_bytes: Some(256 * 1024 * 1024),
            max_stack_size_bytes: Some(1024 * 1024),
            merge_operations: true,
            max_reorder_window: 64,
            allow_unsafe_fallback: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `RILL_*` environment variables.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `RILL_PROVIDER` | `provider` |
    /// | `RILL_TIMEOUT_MS` | `timeoutMs` |
    /// | `RILL_DEBUG` | `debug` |
    /// | `RILL_REQUIRE_WHITELIST` | `requireWhitelist` (comma separated) |
    /// | `RILL_RECEIVER_MAX_BATCH_SIZE` | `receiverMaxBatchSize` |
    /// | `RILL_MEMORY_LIMIT_BYTES` | `memoryLimitBytes` |
    /// | `RILL_ALLOW_UNSAFE_FALLBACK` | `allowUnsafeFallback` |
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(kind) = env_var::<ProviderKind>("RILL_PROVIDER") {
            self.provider = Some(kind);
        }
        if let Some(ms) = env_var("RILL_TIMEOUT_MS") {
            self.timeout_ms = ms;
        }
        self.debug = env_bool_or("RILL_DEBUG", self.debug);
        let whitelist = env_list("RILL_REQUIRE_WHITELIST");
        if !whitelist.is_empty() {
            self.require_whitelist = whitelist;
        }
        if let Some(n) = env_var("RILL_RECEIVER_MAX_BATCH_SIZE") {
            self.receiver_max_batch_size = n;
        }
        if let Some(bytes) = env_var("RILL_MEMORY_LIMIT_BYTES") {
            self.memory_limit_bytes = Some(bytes);
        }
        self.allow_unsafe_fallback = env_bool_or("RILL_ALLOW_UNSAFE_FALLBACK", self.allow_unsafe_fallback);
        self
    }

    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid engine config in {}", path.display()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub(crate) fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions::default()
            .with_timeout(self.timeout())
            .with_memory_limit(self.memory_limit_bytes)
            .with_max_stack_size(self.max_stack_size_bytes)
    }

    pub fn allows(&self, module: &str) -> bool {
        self.require_whitelist.iter().any(|m| m == module)
    }
}

/// Sink for guest `console.*` output.
pub trait GuestLogger: Send + Sync {
    fn log(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// `onMetric(name, valueMs, extra)`.
pub type MetricCallback = Box<dyn Fn(&str, f64, Option<&serde_json::Value>)>;

/// Everything needed to construct an engine.
pub struct EngineOptions {
    pub config: EngineConfig,
    pub provider: Option<SandboxProvider>,
    pub logger: Option<Arc<dyn GuestLogger>>,
    pub on_metric: Option<MetricCallback>,
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("config", &self.config)
            .field("provider", &self.provider.as_ref().map(SandboxProvider::kind))
            .field("logger", &self.logger.is_some())
            .field("on_metric", &self.on_metric.is_some())
            .finish()
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl From<EngineConfig> for EngineOptions {
    fn from(config: EngineConfig) -> Self {
        Self::new(config)
    }
}

impl EngineOptions {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            provider: None,
            logger: None,
            on_metric: None,
        }
    }

    /// Use this provider instead of probing.
    pub fn with_provider(mut self, provider: SandboxProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn GuestLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_on_metric(
        mut self,
        f: impl Fn(&str, f64, Option<&serde_json::Value>) + 'static,
    ) -> Self {
        self.on_metric = Some(Box::new(f));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn with_require_whitelist<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.require_whitelist = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_receiver_max_batch_size(mut self, n: usize) -> Self {
        self.config.receiver_max_batch_size = n;
        self
    }

    pub fn with_merge_operations(mut self, merge: bool) -> Self {
        self.config.merge_operations = merge;
        self
    }
}
