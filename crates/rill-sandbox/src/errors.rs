//! Sandbox error types.

/// Failure of a sandbox operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// Evaluation exceeded its time budget.
    Timeout {
        /// Configured budget
        limit_ms: u64,
        /// Wall-clock time spent before the evaluation was stopped
        elapsed_ms: u64,
    },

    /// Uncaught guest exception.
    Execution {
        /// Error constructor name (`TypeError`, `UnsupportedRequireError`, ...)
        name: String,
        message: String,
        stack: Option<String>,
    },

    /// The context or runtime was disposed.
    Disposed,

    /// The worker backing the runtime was terminated (after a timeout or a
    /// crash) and cannot serve further requests.
    Terminated,

    /// The provider cannot run in this environment.
    Unavailable(String),

    /// Engine-level failure unrelated to guest code.
    Internal(String),
}

impl SandboxError {
    pub fn execution(name: impl Into<String>, message: impl Into<String>) -> Self {
        SandboxError::Execution {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout { .. })
    }

    /// Name of the guest exception, if this is one.
    pub fn exception_name(&self) -> Option<&str> {
        match self {
            SandboxError::Execution { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Timeout {
                limit_ms,
                elapsed_ms,
            } => write!(
                f,
                "execution timed out after {}ms (limit {}ms)",
                elapsed_ms, limit_ms
            ),
            SandboxError::Execution { name, message, .. } => write!(f, "{}: {}", name, message),
            SandboxError::Disposed => write!(f, "sandbox context has been disposed"),
            SandboxError::Terminated => write!(f, "sandbox worker was terminated"),
            SandboxError::Unavailable(msg) => write!(f, "sandbox provider unavailable: {}", msg),
            SandboxError::Internal(msg) => write!(f, "sandbox internal error: {}", msg),
        }
    }
}

impl std::error::Error for SandboxError {}

/// Error returned by a native function. Thrown in the guest as an `Error`
/// whose `name` is [`NativeError::name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub name: String,
    pub message: String,
}

impl NativeError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for NativeError {}
