use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use switchyard_api::errors::{ReplyError, ReplyFailure};
use tokio::task::AbortHandle;

use super::message::Message;

pub type ReplyHandler = Box<dyn FnOnce(Result<Message, ReplyError>) + Send + 'static>;

/// Body of a reply that reports a failure instead of a value.
///
/// Sent by [`Message::fail`] and by nodes that find no handler for a
/// point-to-point message. It has its own codec so it crosses nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyException {
    pub failure: ReplyFailure,
    pub code: i32,
    pub message: String,
}

impl ReplyException {
    pub fn recipient_failure(code: i32, message: impl Into<String>) -> Self {
        Self { failure: ReplyFailure::RecipientFailure, code, message: message.into() }
    }

    pub fn no_handlers(address: impl Into<String>) -> Self {
        Self { failure: ReplyFailure::NoHandlers, code: -1, message: address.into() }
    }

    /// The error handed to the reply handler.
    pub fn into_error(self, replied_address: &str) -> ReplyError {
        match self.failure {
            ReplyFailure::RecipientFailure => ReplyError::RecipientFailure { code: self.code, message: self.message },
            ReplyFailure::NoHandlers => ReplyError::NoHandlers { address: replied_address.to_string() },
            ReplyFailure::Timeout => ReplyError::Timeout {
                address: replied_address.to_string(),
                timeout: Duration::from_millis(self.code.max(0) as u64),
            },
        }
    }
}

/// Bookkeeping of a one-shot reply registration.
///
/// Exactly one of reply, timeout or immediate failure settles it; the
/// `settled` flag decides the race.
pub(crate) struct ReplyState {
    pub(crate) replied_address: String,
    pub(crate) timeout: Duration,
    settled: AtomicBool,
    timer: Mutex<Option<AbortHandle>>,
    handler: Mutex<Option<ReplyHandler>>,
}

impl ReplyState {
    pub(crate) fn new(replied_address: String, timeout: Duration, handler: ReplyHandler) -> Self {
        Self {
            replied_address,
            timeout,
            settled: AtomicBool::new(false),
            timer: Mutex::new(None),
            handler: Mutex::new(Some(handler)),
        }
    }

    /// Claim the right to settle. Only the first caller gets `true`.
    pub(crate) fn try_settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub(crate) fn set_timer(&self, timer: AbortHandle) {
        let mut slot = self.timer.lock();
        if self.is_settled() {
            timer.abort();
        } else {
            *slot = Some(timer);
        }
    }

    pub(crate) fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    pub(crate) fn take_handler(&self) -> Option<ReplyHandler> {
        self.handler.lock().take()
    }
}
