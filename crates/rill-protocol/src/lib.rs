//! Cross-boundary protocol for the rill sandbox.
//!
//! Everything here is pure host-side logic with no knowledge of how guest code
//! is actually executed:
//!
//! - [`codec`]: the ordered type-rule engine that turns [`rill_types::Value`]s
//!   into JSON transport values and back
//! - [`callbacks`]: opaque function ids standing in for functions that live on
//!   the other side of the boundary
//! - [`collector`] / [`merger`]: guest-side batching and same-key collapsing of
//!   tree operations
//! - [`receiver`]: host-side application of batches to a node tree, with
//!   admission control and an activity timeline
//!
//! # Example
//!
//! ```
//! use rill_protocol::{OperationCollector, Receiver};
//! use rill_types::{Operation, Value};
//!
//! let mut collector = OperationCollector::new();
//! collector.push(Operation::create(1, "Text", Default::default()));
//! collector.push(Operation::append(0, 1));
//!
//! let mut receiver = Receiver::new(100);
//! collector.flush(|batch| {
//!     receiver.apply_batch(batch.map_values(&mut |v| Value::from_json(&v)));
//! });
//! assert_eq!(receiver.node_count(), 2); // root + text
//! ```

pub mod callbacks;
pub mod codec;
pub mod collector;
pub mod errors;
pub mod merger;
pub mod receiver;
pub mod timeline;

pub use callbacks::{CallbackRegistration, CallbackRegistry};
pub use codec::{Codec, CodecHooks, DecodeCx, EncodeCx, LoopbackHooks, TypeRule};
pub use collector::OperationCollector;
pub use errors::{CallbackError, ProtocolError};
pub use merger::OperationMerger;
pub use receiver::{ApplyOutcome, NodeInstance, Receiver, ReceiverStats, RefHandler};
pub use timeline::{ActivityPoint, ActivitySnapshot, ActivityTimeline};
