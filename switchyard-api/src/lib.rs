//! # Switchyard API
//!
//! Interface layer shared by the Switchyard runtime and its pluggable
//! collaborators: metrics observers, message codecs and cluster transports.
//! Nothing in here schedules work; it only fixes the shapes that the runtime
//! and its plugins agree on.
//!
//! ## Core Components
//!
//! - **Errors**: reply failure classification and collaborator error types
//! - **Metrics**: observer hooks for loops, pools and the event bus
//! - **Codecs**: body encoding used whenever a message leaves the process
//! - **Cluster**: the transport seam used for remote delivery
//!
//! ## Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//! use switchyard_api::metrics::{EventBusMetrics, Metrics};
//!
//! #[derive(Debug)]
//! struct Counting;
//!
//! #[derive(Debug)]
//! struct CountingBus;
//!
//! impl EventBusMetrics for CountingBus {
//!     fn message_sent(&self, address: &str, publish: bool, local: bool, remote: bool) {
//!         println!("sent to {address} publish={publish} local={local} remote={remote}");
//!     }
//! }
//!
//! impl Metrics for Counting {
//!     fn create_event_bus_metrics(&self) -> Arc<dyn EventBusMetrics> {
//!         Arc::new(CountingBus)
//!     }
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`errors`]: reply, codec and transport errors
//! - [`types`]: common type definitions
//! - [`metrics`]: observer traits and their no-op defaults
//! - [`codec`]: the message codec trait
//! - [`cluster`]: wire envelope and cluster transport traits

pub mod cluster;
pub mod codec;
pub mod errors;
pub mod metrics;
pub mod types;

pub use cluster::{ClusterTransport, Envelope, EnvelopeSink};
pub use codec::MessageCodec;
pub use errors::{CodecError, ReplyError, ReplyFailure, TransportError};
pub use metrics::{EventBusMetrics, Metrics, NoopMetrics, PoolKind, PoolMetrics};
pub use types::{Body, Headers, NodeId, RegistrationId};
