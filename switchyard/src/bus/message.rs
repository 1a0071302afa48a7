use std::any::Any;
use std::fmt;

use switchyard_api::errors::ReplyError;
use switchyard_api::types::{Body, Headers, NodeId};

use super::reply::ReplyException;
use super::EventBus;
use crate::config::DeliveryOptions;
use crate::error::BusError;

/// A message as seen by a handler or a reply handler.
#[derive(Clone)]
pub struct Message {
    pub(crate) address: String,
    pub(crate) reply_address: Option<String>,
    pub(crate) headers: Headers,
    pub(crate) body: Body,
    pub(crate) send: bool,
    /// Node the message arrived from; `None` for local messages.
    pub(crate) origin: Option<NodeId>,
    pub(crate) bus: EventBus,
}

impl Message {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.reply_address.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `true` for point-to-point messages, `false` for publish.
    pub fn is_send(&self) -> bool {
        self.send
    }

    /// The node this message came from, for messages received over the
    /// cluster transport.
    pub fn origin(&self) -> Option<&NodeId> {
        self.origin.as_ref()
    }

    /// The body, if it is a `T`.
    pub fn body<T: Any>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }

    pub fn raw_body(&self) -> &Body {
        &self.body
    }

    /// Answer the sender. A no-op when the sender expects no reply.
    pub fn reply<B>(&self, body: B) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
    {
        self.bus.reply_to(self, body, DeliveryOptions::default(), None)
    }

    pub fn reply_with_options<B>(&self, body: B, options: DeliveryOptions) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
    {
        self.bus.reply_to(self, body, options, None)
    }

    /// Answer the sender and wait for its answer in turn.
    pub fn reply_with<B, H>(&self, body: B, options: DeliveryOptions, handler: H) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
        H: FnOnce(Result<Message, ReplyError>) + Send + 'static,
    {
        self.bus.reply_to(self, body, options, Some(Box::new(handler)))
    }

    /// Report a recipient failure to the sender.
    pub fn fail(&self, code: i32, message: impl Into<String>) -> Result<(), BusError> {
        self.reply(ReplyException::recipient_failure(code, message))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("address", &self.address)
            .field("reply_address", &self.reply_address)
            .field("headers", &self.headers)
            .field("send", &self.send)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
