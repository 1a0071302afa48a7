//! # Error Types
//!
//! Errors that cross the boundary between the runtime and its collaborators.
//!
//! ## Reply failures
//!
//! Every `send` that expects a reply ends in exactly one outcome. The failed
//! outcomes are classified by [`ReplyFailure`] and carried to the sender's
//! reply handler as a [`ReplyError`]:
//!
//! ```rust
//! use switchyard_api::errors::{ReplyError, ReplyFailure};
//!
//! fn describe(error: &ReplyError) -> &'static str {
//!     match error.failure_type() {
//!         ReplyFailure::Timeout => "nobody answered in time",
//!         ReplyFailure::NoHandlers => "nobody is listening",
//!         ReplyFailure::RecipientFailure => "the recipient refused",
//!     }
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeId;

/// Classification of a failed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplyFailure {
    /// No reply arrived before the deadline.
    Timeout,
    /// No handler was registered for the address.
    NoHandlers,
    /// The recipient explicitly failed the message.
    RecipientFailure,
}

impl fmt::Display for ReplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplyFailure::Timeout => "TIMEOUT",
            ReplyFailure::NoHandlers => "NO_HANDLERS",
            ReplyFailure::RecipientFailure => "RECIPIENT_FAILURE",
        };
        f.write_str(name)
    }
}

/// Failure delivered to a reply handler in place of a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("Timed out after waiting {timeout:?} for a reply to `{address}`")]
    Timeout { address: String, timeout: Duration },

    #[error("No handlers for address `{address}`")]
    NoHandlers { address: String },

    #[error("Recipient failure (code {code}): {message}")]
    RecipientFailure { code: i32, message: String },
}

impl ReplyError {
    /// The failure classification of this error.
    pub fn failure_type(&self) -> ReplyFailure {
        match self {
            ReplyError::Timeout { .. } => ReplyFailure::Timeout,
            ReplyError::NoHandlers { .. } => ReplyFailure::NoHandlers,
            ReplyError::RecipientFailure { .. } => ReplyFailure::RecipientFailure,
        }
    }
}

/// Errors raised while encoding or decoding a message body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Codec `{codec}` failed to encode body: {reason}")]
    Encode { codec: String, reason: String },

    #[error("Codec `{codec}` failed to decode body: {reason}")]
    Decode { codec: String, reason: String },

    #[error("No codec registered under `{0}`")]
    UnknownCodec(String),
}

/// Errors reported by a cluster transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Node `{0}` is not reachable")]
    Unreachable(NodeId),

    #[error("Cluster transport is closed")]
    Closed,

    #[error("Transport failure: {0}")]
    Other(String),
}
