//! Identifier aliases shared by both sides of the boundary.
//!
//! All identifiers are plain integers on the wire. They are only meaningful
//! within one engine session and are never reused inside it.

/// Guest-allocated node identifier.
pub type NodeId = u64;

/// Identifier standing in for a function that lives on the other side.
pub type FnId = u64;

/// Identifier of a promise placeholder awaiting `PROMISE_SETTLE`.
pub type PromiseId = u64;

/// Correlates `CALL_FUNCTION` / `REF_CALL` with their results.
pub type CallId = u64;

/// Monotonic batch counter, starting at 1 per guest session.
pub type BatchId = u64;

/// Wire protocol version stamped on every operation batch.
pub const PROTOCOL_VERSION: u32 = 1;

/// The synthetic container node every receiver starts with.
pub const ROOT_NODE_ID: NodeId = 0;
