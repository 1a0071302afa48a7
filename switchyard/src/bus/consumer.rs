use std::fmt;
use std::sync::Arc;

use switchyard_api::types::RegistrationId;

use super::registry::HandlerHolder;
use super::EventBus;
use crate::completion::Promise;
use crate::context::Context;
use crate::error::BusError;

/// Handle to a standing handler registration.
///
/// Dropping the handle does not unregister the handler.
pub struct MessageConsumer {
    bus: EventBus,
    holder: Arc<HandlerHolder>,
    completion: Promise<Result<(), BusError>>,
}

impl MessageConsumer {
    pub(crate) fn new(bus: EventBus, holder: Arc<HandlerHolder>, completion: Promise<Result<(), BusError>>) -> Self {
        Self { bus, holder, completion }
    }

    pub fn address(&self) -> &str {
        &self.holder.address
    }

    pub fn id(&self) -> RegistrationId {
        self.holder.id
    }

    /// The context the handler runs on.
    pub fn context(&self) -> &Context {
        &self.holder.context
    }

    pub fn is_registered(&self) -> bool {
        !self.holder.is_removed()
    }

    /// Completes once the registration is visible everywhere it needs to
    /// be: immediately for a local bus, after the cluster acknowledged it
    /// otherwise.
    pub fn completion(&self) -> Promise<Result<(), BusError>> {
        self.completion.clone()
    }

    /// Run `handler` on the consumer's context when registration completes.
    pub fn completion_handler<F>(&self, handler: F)
    where
        F: FnOnce(Result<(), BusError>) + Send + 'static,
    {
        on_context(&self.holder.context, &self.completion, handler);
    }

    /// Remove the handler. Later calls return an already completed promise.
    pub fn unregister(&self) -> Promise<Result<(), BusError>> {
        self.bus.unregister(&self.holder)
    }

    /// Remove the handler and run `handler` on the consumer's context once
    /// the removal is complete.
    pub fn unregister_with<F>(&self, handler: F)
    where
        F: FnOnce(Result<(), BusError>) + Send + 'static,
    {
        let done = self.unregister();
        on_context(&self.holder.context, &done, handler);
    }
}

fn on_context<F>(context: &Context, promise: &Promise<Result<(), BusError>>, handler: F)
where
    F: FnOnce(Result<(), BusError>) + Send + 'static,
{
    let context = context.clone();
    promise.on_complete(move |result| {
        if let Err(e) = context.run_on_context(move || handler(result)) {
            crate::log_error!(e, source = "consumer_completion");
        }
    });
}

impl fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("id", &self.holder.id)
            .field("address", &self.holder.address)
            .field("registered", &self.is_registered())
            .finish()
    }
}
