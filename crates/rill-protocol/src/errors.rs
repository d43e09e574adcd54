//! Protocol-level error types.
//!
//! None of these are fatal to the host. Callers log them and drop the offending
//! message or operation.

use rill_types::{BatchId, CallId, FnId, NodeId, PromiseId};

/// A violation of the cross-boundary protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A call named a function id that is not (or no longer) registered.
    UnknownFunction {
        fn_id: FnId,
        /// True when the id was allocated in this session and later released.
        released: bool,
    },

    /// A settlement named a promise id nobody is waiting on.
    UnknownPromise { promise_id: PromiseId },

    /// A call result named a call id nobody is waiting on.
    UnknownCall { call_id: CallId },

    /// A promise placeholder was settled a second time.
    DoubleSettlement { promise_id: PromiseId },

    /// The message could not be interpreted.
    Malformed(String),

    /// An operation referenced a node the receiver does not know.
    UnknownNode { op: &'static str, id: NodeId },

    /// `CREATE` for an id that already exists.
    DuplicateNode { id: NodeId },

    /// A batch arrived whose id was already delivered.
    StaleBatch { batch_id: BatchId, expected: BatchId },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::UnknownFunction { fn_id, released } => {
                if *released {
                    write!(f, "function {} was released and can no longer be called", fn_id)
                } else {
                    write!(f, "unknown function id {}", fn_id)
                }
            }
            ProtocolError::UnknownPromise { promise_id } => {
                write!(f, "no pending promise with id {}", promise_id)
            }
            ProtocolError::UnknownCall { call_id } => {
                write!(f, "no pending call with id {}", call_id)
            }
            ProtocolError::DoubleSettlement { promise_id } => {
                write!(f, "promise {} was already settled", promise_id)
            }
            ProtocolError::Malformed(msg) => write!(f, "malformed message: {}", msg),
            ProtocolError::UnknownNode { op, id } => write!(f, "{} references unknown node {}", op, id),
            ProtocolError::DuplicateNode { id } => write!(f, "node {} already exists", id),
            ProtocolError::StaleBatch { batch_id, expected } => write!(
                f,
                "stale batch {} (next expected batch is {})",
                batch_id, expected
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Failure of [`crate::CallbackRegistry::invoke`].
#[derive(Debug)]
pub enum CallbackError {
    NotFound { fn_id: FnId, released: bool },
    /// The function itself failed.
    Failed(anyhow::Error),
}

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackError::NotFound { fn_id, released } => {
                let state = if *released { "released" } else { "not registered" };
                write!(f, "NotFound: callback {} is {}", fn_id, state)
            }
            CallbackError::Failed(err) => write!(f, "callback failed: {:#}", err),
        }
    }
}

impl std::error::Error for CallbackError {}

impl CallbackError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CallbackError::NotFound { .. })
    }

    /// The protocol view of the failure, if it is one.
    pub fn as_protocol_error(&self) -> Option<ProtocolError> {
        match self {
            CallbackError::NotFound { fn_id, released } => Some(ProtocolError::UnknownFunction {
                fn_id: *fn_id,
                released: *released,
            }),
            CallbackError::Failed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_function_message() {
        let err = ProtocolError::UnknownFunction {
            fn_id: 7,
            released: true,
        };
        assert!(err.to_string().contains("released"));

        let cb = CallbackError::NotFound {
            fn_id: 7,
            released: true,
        };
        assert!(cb.is_not_found());
        assert_eq!(cb.as_protocol_error(), Some(err));
    }

    #[test]
    fn test_failed_callback_keeps_cause_chain() {
        let cause = anyhow::anyhow!("disk full").context("writing cache");
        let msg = CallbackError::Failed(cause).to_string();
        assert!(msg.contains("writing cache"));
        assert!(msg.contains("disk full"));
    }
}
