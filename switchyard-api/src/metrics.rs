//! # Metrics Observer
//!
//! Hook points the runtime calls while it schedules and delivers work. The
//! runtime never depends on whether or how these events are recorded; every
//! method has a no-op default so an observer implements only what it needs.
//!
//! A [`Metrics`] implementation is handed to the runtime at start-up. It is
//! asked once for each pool's [`PoolMetrics`] and once for the
//! [`EventBusMetrics`] and those objects receive the fine-grained events.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ReplyFailure;
use crate::types::RegistrationId;

/// What a worker pool is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// The default pool running worker contexts and `execute_blocking`.
    Worker,
    /// The pool reserved for the runtime's own blocking operations.
    InternalBlocking,
    /// A named pool obtained from the shared pool registry.
    Shared,
}

/// Root observer; a factory for the per-component observers.
pub trait Metrics: Send + Sync + fmt::Debug {
    /// An event loop thread was started.
    fn event_loop_created(&self, _name: &str) {}

    /// A worker pool was created.
    fn create_pool_metrics(&self, _kind: PoolKind, _name: &str, _max_size: usize) -> Arc<dyn PoolMetrics> {
        Arc::new(NoopPoolMetrics)
    }

    /// The event bus was created.
    fn create_event_bus_metrics(&self) -> Arc<dyn EventBusMetrics> {
        Arc::new(NoopEventBusMetrics)
    }
}

/// Observer for one worker pool.
pub trait PoolMetrics: Send + Sync + fmt::Debug {
    /// A task entered the queue.
    fn submitted(&self) {}

    /// A task left the queue after waiting `waited`.
    fn begin(&self, _waited: Duration) {}

    /// A task finished after running for `ran`.
    fn end(&self, _succeeded: bool, _ran: Duration) {}

    /// The pool was closed.
    fn closed(&self) {}
}

/// Observer for the event bus.
///
/// Handler events are keyed by the [`RegistrationId`] handed out in
/// `handler_registered`; reply registrations carry the address they reply
/// to in `replied_address`.
pub trait EventBusMetrics: Send + Sync + fmt::Debug {
    fn handler_registered(&self, _id: RegistrationId, _address: &str, _replied_address: Option<&str>) {}

    fn handler_unregistered(&self, _id: RegistrationId) {}

    /// A message was queued on the handler's context.
    fn schedule_message(&self, _id: RegistrationId, _local: bool) {}

    /// The handler's context started running the message.
    fn begin_handle_message(&self, _id: RegistrationId, _local: bool) {}

    /// The handler returned; `failure` is set when it failed or panicked.
    fn end_handle_message(&self, _id: RegistrationId, _failure: Option<&anyhow::Error>) {}

    fn message_sent(&self, _address: &str, _publish: bool, _local: bool, _remote: bool) {}

    fn message_received(&self, _address: &str, _publish: bool, _local: bool, _handlers: usize) {}

    /// Encoded bytes written to the cluster transport for `address`.
    fn message_written(&self, _address: &str, _bytes: usize) {}

    /// Encoded bytes read from the cluster transport for `address`.
    fn message_read(&self, _address: &str, _bytes: usize) {}

    fn reply_failure(&self, _address: &str, _failure: ReplyFailure) {}

    fn closed(&self) {}
}

/// Observer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPoolMetrics;

impl PoolMetrics for NoopPoolMetrics {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventBusMetrics;

impl EventBusMetrics for NoopEventBusMetrics {}
