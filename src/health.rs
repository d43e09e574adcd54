//! Health and diagnostics read models. Derived data only; nothing here is
//! consulted for correctness.

use chrono::{DateTime, Utc};
use rill_protocol::{ActivitySnapshot, ReceiverStats};
use rill_sandbox::{MemoryStats, ProviderKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Initializing,
    Loaded,
    Error,
    Destroyed,
}

/// Lifetime error counter. Never decremented.
#[derive(Debug, Clone, Default)]
pub(crate) struct HealthTracker {
    error_count: u64,
    last_error_at: Option<DateTime<Utc>>,
}

impl HealthTracker {
    pub(crate) fn record_error(&mut self) {
        self.error_count += 1;
        self.last_error_at = Some(Utc::now());
    }

    pub(crate) fn error_count(&self) -> u64 {
        self.error_count
    }

    pub(crate) fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.last_error_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealth {
    pub loaded: bool,
    pub destroyed: bool,
    pub error_count: u64,
    pub last_error_at: Option<DateTime<Utc>>,
    pub receiver_nodes: usize,
    pub state: EngineState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDiagnostics {
    pub engine_id: String,
    pub provider: Option<ProviderKind>,
    pub health: EngineHealth,
    pub activity: ActivitySnapshot,
    pub receiver: Option<ReceiverStats>,
    pub memory: Option<MemoryStats>,
    /// Host functions currently exposed to the guest.
    pub host_callbacks: usize,
    /// Host-side placeholders waiting for the guest to settle them.
    pub pending_promises: usize,
    pub pending_calls: usize,
}
