use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::errors::NativeError;

/// Limits applied to a runtime when it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Budget for a single evaluation (including the microtasks it queues).
    pub timeout: Duration,
    /// Heap cap in bytes; `None` leaves the interpreter unbounded.
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_limit: Some(256 * 1024 * 1024),
            max_stack_size: Some(1024 * 1024),
        }
    }
}

impl RuntimeOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_limit(mut self, bytes: Option<usize>) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_max_stack_size(mut self, bytes: Option<usize>) -> Self {
        self.max_stack_size = bytes;
        self
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis().min(u64::MAX as u128) as u64
    }
}

/// Heap statistics reported by providers that can measure them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub malloc_bytes: u64,
    pub used_bytes: u64,
    pub limit_bytes: Option<u64>,
}

/// Host function exposed to guest code.
///
/// Arguments and the return value cross the boundary as JSON. Native functions
/// may run on a worker thread, hence `Send + Sync`.
pub type NativeFunction = Arc<dyn Fn(Vec<Json>) -> Result<Json, NativeError> + Send + Sync>;

/// Wrap a closure as a [`NativeFunction`].
pub fn native<F>(f: F) -> NativeFunction
where
    F: Fn(Vec<Json>) -> Result<Json, NativeError> + Send + Sync + 'static,
{
    Arc::new(f)
}
