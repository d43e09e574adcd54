//! Shared types for the rill workspace.
//!
//! This crate holds the vocabulary every other crate speaks:
//!
//! - [`value`]: the host-side dynamic value model ([`Value`], [`Callable`],
//!   [`JsPromise`]) that the codec moves across the isolation boundary
//! - [`operation`]: tree-mutation operations and batches produced by the guest
//! - [`message`]: the tagged wire messages exchanged between host and guest
//! - [`ids`]: identifier aliases and protocol constants
//! - [`env_utils`]: typed environment variable parsing used by config layers

pub mod env_utils;
pub mod ids;
pub mod message;
pub mod operation;
pub mod value;

pub use env_utils::{env_bool, env_bool_or, env_list, env_var, env_var_or};
pub use ids::{BatchId, CallId, FnId, NodeId, PromiseId, PROTOCOL_VERSION, ROOT_NODE_ID};
pub use message::{BridgeMessage, SettleStatus};
pub use operation::{Operation, OperationBatch, OperationKind, Props, SerializedValue};
pub use value::{
    Callable, ErrorValue, JsPromise, ObjectMap, PromiseState, RegExpValue, Settlement, Value,
};
