//! Rill: sandboxed guest UI engine
//!
//! Runs untrusted guest bundles in an isolated JavaScript context and mirrors
//! the UI tree they build on the host:
//!
//! - **Sandboxing**: provider selection, timeouts and heap limits live in
//!   [`rill_sandbox`]
//! - **Protocol**: the value codec, callback registry, operation batching
//!   and the host receiver live in [`rill_protocol`]
//! - **Engine**: [`Engine`] ties a sandbox context, the [`bridge::Bridge`]
//!   and a [`rill_protocol::Receiver`] together for one guest lifetime
//!
//! # Example
//!
//! ```no_run
//! use rill::{Engine, EngineConfig};
//!
//! # async fn run() -> Result<(), rill::EngineError> {
//! let engine = Engine::with_config(EngineConfig::default())?;
//! let receiver = engine.create_receiver(|r| println!("{} nodes", r.node_count()))?;
//! engine
//!     .load_bundle("Rill.appendChild(Rill.ROOT_ID, Rill.createNode('View', {}));", None)
//!     .await?;
//! assert_eq!(receiver.borrow().node_count(), 2);
//! engine.destroy();
//! # Ok(())
//! # }
//! ```

#![allow(clippy::type_complexity)]

pub mod bridge;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod health;
pub mod promise;
pub mod sequencer;

pub use bridge::Bridge;
pub use config::{DiagnosticsConfig, EngineConfig, EngineOptions, GuestLogger, MetricCallback};
pub use engine::{Engine, GUEST_RUNTIME};
pub use errors::{EngineError, UNSUPPORTED_REQUIRE};
pub use events::{EngineEvent, EngineEventKind, Subscription};
pub use health::{EngineDiagnostics, EngineHealth, EngineState};
pub use sequencer::BatchSequencer;

pub use rill_protocol::{Receiver, ReceiverStats};
pub use rill_sandbox::{ProviderKind, SandboxProvider};
pub use rill_types::{BridgeMessage, ErrorValue, Value};
