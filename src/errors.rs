//! Engine error taxonomy.

use rill_protocol::ProtocolError;
use rill_sandbox::SandboxError;

/// Exception name the guest runtime throws for whitelist violations.
pub const UNSUPPORTED_REQUIRE: &str = "UnsupportedRequireError";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Execution exceeded its budget.
    Timeout { limit_ms: u64, elapsed_ms: u64 },

    /// The bundle required a module outside the whitelist.
    UnsupportedRequire { module: String },

    /// Uncaught guest exception.
    Execution {
        name: String,
        message: String,
        stack: Option<String>,
    },

    Protocol(ProtocolError),

    /// The engine was destroyed; nothing further is accepted.
    Destroyed,

    /// The call is not valid in the engine's current state.
    InvalidState(String),

    /// Provider failure not attributable to guest code.
    Sandbox(SandboxError),

    Config(String),
}

impl EngineError {
    /// Taxonomy name, as reported to embedders.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Timeout { .. } => "TimeoutError",
            EngineError::UnsupportedRequire { .. } => "UnsupportedRequireError",
            EngineError::Execution { .. } => "ExecutionError",
            EngineError::Protocol(_) => "ProtocolError",
            EngineError::Destroyed => "DestroyedError",
            EngineError::InvalidState(_) => "InvalidStateError",
            EngineError::Sandbox(_) => "SandboxError",
            EngineError::Config(_) => "ConfigError",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }

    /// Attach the require that tripped the whitelist, if the guest raised an
    /// `UnsupportedRequireError` (or swallowed it and failed later).
    pub(crate) fn from_sandbox(err: SandboxError, violation: Option<String>) -> Self {
        if let Some(module) = violation {
            if !err.is_timeout() {
                return EngineError::UnsupportedRequire { module };
            }
        }
        err.into()
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Timeout {
                limit_ms,
                elapsed_ms,
            } => write!(
                f,
                "TimeoutError: execution exceeded {}ms (stopped after {}ms)",
                limit_ms, elapsed_ms
            ),
            EngineError::UnsupportedRequire { module } => {
                write!(f, "UnsupportedRequireError: Unsupported require: '{}'", module)
            }
            EngineError::Execution { name, message, .. } => {
                write!(f, "ExecutionError: {}: {}", name, message)
            }
            EngineError::Protocol(err) => write!(f, "ProtocolError: {}", err),
            EngineError::Destroyed => write!(f, "engine has been destroyed"),
            EngineError::InvalidState(msg) => write!(f, "invalid engine state: {}", msg),
            EngineError::Sandbox(err) => write!(f, "{}", err),
            EngineError::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Protocol(err) => Some(err),
            EngineError::Sandbox(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout {
                limit_ms,
                elapsed_ms,
            } => EngineError::Timeout {
                limit_ms,
                elapsed_ms,
            },
            SandboxError::Execution {
                name,
                message,
                stack,
            } => {
                if name == UNSUPPORTED_REQUIRE {
                    EngineError::UnsupportedRequire {
                        module: required_module(&message),
                    }
                } else {
                    EngineError::Execution {
                        name,
                        message,
                        stack,
                    }
                }
            }
            // A disposed context only means this session is over. Callers
            // that know the engine itself is gone report `Destroyed` first.
            SandboxError::Disposed => {
                EngineError::InvalidState("sandbox context was disposed".to_string())
            }
            other => EngineError::Sandbox(other),
        }
    }
}

impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        EngineError::Protocol(err)
    }
}

/// Module name out of "Unsupported require: 'x'".
fn required_module(message: &str) -> String {
    message
        .split('\'')
        .nth(1)
        .filter(|m| !m.is_empty())
        .unwrap_or(message)
        .to_string()
}
