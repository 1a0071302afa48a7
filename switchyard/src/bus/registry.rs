use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use switchyard_api::types::RegistrationId;

use super::message::Message;
use super::reply::ReplyState;
use crate::context::Context;
use crate::error::panic_message;

pub type ConsumerFn = Box<dyn FnMut(Message) -> anyhow::Result<()> + Send + 'static>;

pub(crate) enum HolderKind {
    /// A consumer that stays registered until unregistered.
    Standing {
        handler: Mutex<ConsumerFn>,
        local_only: bool,
    },
    /// A reply registration, removed after its first outcome.
    OneShot(ReplyState),
}

/// One registration of a handler at an address.
pub(crate) struct HandlerHolder {
    pub(crate) id: RegistrationId,
    pub(crate) address: String,
    pub(crate) context: Context,
    pub(crate) kind: HolderKind,
    removed: AtomicBool,
}

impl HandlerHolder {
    pub(crate) fn standing(id: RegistrationId, address: String, context: Context, handler: ConsumerFn, local_only: bool) -> Self {
        Self {
            id,
            address,
            context,
            kind: HolderKind::Standing { handler: Mutex::new(handler), local_only },
            removed: AtomicBool::new(false),
        }
    }

    pub(crate) fn one_shot(id: RegistrationId, address: String, context: Context, state: ReplyState) -> Self {
        Self { id, address, context, kind: HolderKind::OneShot(state), removed: AtomicBool::new(false) }
    }

    pub(crate) fn reply_state(&self) -> Option<&ReplyState> {
        match &self.kind {
            HolderKind::OneShot(state) => Some(state),
            HolderKind::Standing { .. } => None,
        }
    }

    /// Whether the registration is advertised to the cluster.
    pub(crate) fn is_advertised(&self) -> bool {
        matches!(self.kind, HolderKind::Standing { local_only: false, .. })
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Invoke a standing handler. Errors and panics both count as failure.
    pub(crate) fn call(&self, message: Message) -> Option<anyhow::Error> {
        let HolderKind::Standing { handler, .. } = &self.kind else {
            return None;
        };
        let mut handler = handler.lock();
        match panic::catch_unwind(AssertUnwindSafe(|| (*handler)(message))) {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(payload) => Some(anyhow::anyhow!("handler panicked: {}", panic_message(&*payload))),
        }
    }
}

/// Address to handlers, in registration order.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<HandlerHolder>>>>,
}

impl HandlerRegistry {
    pub(crate) fn insert(&self, holder: Arc<HandlerHolder>) {
        self.handlers.write().entry(holder.address.clone()).or_default().push(holder);
    }

    /// Remove `holder`. Returns `false` if it was not registered, so every
    /// registration is removed at most once.
    pub(crate) fn remove(&self, holder: &Arc<HandlerHolder>) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&holder.address) else {
            return false;
        };
        let Some(index) = list.iter().position(|h| Arc::ptr_eq(h, holder)) else {
            return false;
        };
        list.remove(index);
        if list.is_empty() {
            handlers.remove(&holder.address);
        }
        holder.removed.store(true, Ordering::Release);
        true
    }

    /// Snapshot of the handlers at `address`.
    pub(crate) fn lookup(&self, address: &str) -> Vec<Arc<HandlerHolder>> {
        self.handlers.read().get(address).cloned().unwrap_or_default()
    }

    pub(crate) fn count(&self, address: &str) -> usize {
        self.handlers.read().get(address).map_or(0, Vec::len)
    }

    /// Remove every registration.
    pub(crate) fn drain(&self) -> Vec<Arc<HandlerHolder>> {
        let drained: Vec<_> = self.handlers.write().drain().flat_map(|(_, list)| list).collect();
        for holder in &drained {
            holder.removed.store(true, Ordering::Release);
        }
        drained
    }
}
