use std::sync::Arc;

use switchyard_api::errors::{CodecError, TransportError};
use thiserror::Error;

/// Errors related to event loop group operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("Event loop group has no event loops")]
    EmptyGroup,
    #[error("Can't find event loop `{0}` to remove")]
    NotFound(String),
    #[error("Event loop group is shut down")]
    ShutDown,
}

/// Errors related to a single event loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    #[error("Event loop `{0}` rejected the task: it is shut down")]
    Rejected(String),
    #[error("Failed to start event loop thread: {0}")]
    Spawn(String),
}

/// Errors related to worker pools and the shared pool registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool `{0}` is already closed")]
    AlreadyClosed(String),
    #[error("Worker pool `{name}` already exists with size {existing}, requested {requested}")]
    SizeConflict { name: String, existing: usize, requested: usize },
    #[error("Failed to start worker thread: {0}")]
    Spawn(String),
}

/// Outcome of a task that did not produce a value.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(Arc<anyhow::Error>),
    #[error("Task panicked: {0}")]
    Panicked(String),
    #[error("Task was cancelled before it ran")]
    Cancelled,
    #[error("Task was rejected: {0}")]
    Rejected(String),
}

/// Errors returned on the calling thread by event bus operations.
///
/// Delivery outcomes (no handlers, timeouts, recipient failures) never show
/// up here; they go to the sender's reply handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Event bus is closed")]
    AlreadyClosed,
    #[error("No codec registered for body type `{0}`")]
    NoCodec(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Group(#[from] GroupError),
}

/// Errors related to the runtime as a whole.
#[derive(Error, Debug)]
pub enum SystemError {
    #[error("Thread setup error: {0}")]
    ThreadSetupError(String),
    #[error("Runtime is already closed")]
    Closed,
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error("Internal system error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Render a caught panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}
