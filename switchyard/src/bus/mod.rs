//! # Event Bus
//!
//! Address-based messaging between handlers, locally and across a cluster.
//!
//! ## Delivery
//! - `send`: exactly one handler. Candidates are the local handlers in
//!   registration order followed by the remote nodes holding the address;
//!   a per-address cursor walks them round-robin
//! - `publish`: every local handler, plus one copy per remote node
//! - `request`: a `send` whose reply (or failure) comes back to a one-shot
//!   reply handler registered under a fresh address
//!
//! Handlers always run on the context that registered them. Delivery is
//! always asynchronous, even when sender and handler share a context.
//!
//! ## Reply outcomes
//! A request settles exactly once with one of:
//! 1. the reply message
//! 2. `NoHandlers`, when nothing is registered at the address
//! 3. `Timeout`, when no reply arrived in time
//! 4. `RecipientFailure`, when the handler called [`Message::fail`]

mod codec;
mod consumer;
mod message;
mod registry;
mod reply;

pub use codec::{
    BoolCodec, BytesCodec, CodecRegistry, I64Codec, JsonCodec, StringCodec, BOOL_CODEC, BYTES_CODEC, I64_CODEC,
    JSON_CODEC, REPLY_EXCEPTION_CODEC, STRING_CODEC,
};
pub use consumer::MessageConsumer;
pub use message::Message;
pub use reply::{ReplyException, ReplyHandler};

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_api::cluster::{ClusterTransport, Envelope, EnvelopeSink};
use switchyard_api::errors::{ReplyError, TransportError};
use switchyard_api::metrics::{EventBusMetrics, Metrics};
use switchyard_api::types::{Body, NodeId, RegistrationId};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::completion::Promise;
use crate::config::DeliveryOptions;
use crate::context::Context;
use crate::error::{panic_message, BusError};
use crate::event_loop::EventLoopGroup;
use registry::{HandlerHolder, HandlerRegistry, HolderKind};
use reply::ReplyState;

struct BusInner {
    handlers: HandlerRegistry,
    codecs: CodecRegistry,
    metrics: Arc<dyn EventBusMetrics>,
    group: EventLoopGroup,
    timer: Handle,
    transport: Option<Arc<dyn ClusterTransport>>,
    default_send_timeout: Duration,
    next_id: AtomicU64,
    cursors: Mutex<HashMap<String, usize>>,
    closed: AtomicBool,
}

/// A message on its way out, before it is routed.
struct Outgoing {
    address: String,
    body: Body,
    body_type: TypeId,
    type_name: &'static str,
    options: DeliveryOptions,
    reply_address: Option<String>,
    send: bool,
}

impl Outgoing {
    fn new<B: Any + Send + Sync>(address: String, body: B, options: DeliveryOptions, reply_address: Option<String>, send: bool) -> Self {
        // String literals travel as `String` so handlers and codecs see one type.
        let literal = (&body as &dyn Any).downcast_ref::<&'static str>().map(|s| s.to_string());
        let (body, body_type, type_name): (Body, _, _) = match literal {
            Some(s) => (Arc::new(s), TypeId::of::<String>(), type_name::<String>()),
            None => (Arc::new(body), TypeId::of::<B>(), type_name::<B>()),
        };
        Self { address, body, body_type, type_name, options, reply_address, send }
    }
}

/// Receives envelopes from the cluster transport.
struct InboundSink {
    bus: Weak<BusInner>,
}

impl EnvelopeSink for InboundSink {
    fn receive(&self, envelope: Envelope) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus { inner }.receive_remote(envelope);
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub(crate) fn new(
        group: EventLoopGroup,
        timer: Handle,
        metrics: &dyn Metrics,
        default_send_timeout: Duration,
        transport: Option<Arc<dyn ClusterTransport>>,
    ) -> Self {
        let bus = Self {
            inner: Arc::new(BusInner {
                handlers: HandlerRegistry::default(),
                codecs: CodecRegistry::new(),
                metrics: metrics.create_event_bus_metrics(),
                group,
                timer,
                transport,
                default_send_timeout,
                next_id: AtomicU64::new(1),
                cursors: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        };
        if let Some(transport) = &bus.inner.transport {
            transport.bind(Arc::new(InboundSink { bus: Arc::downgrade(&bus.inner) }));
            crate::log_lifecycle!("event_bus", transport.node_id().as_str(), "joined_cluster");
        }
        bus
    }

    /// Identity of this node, when clustered.
    pub fn node_id(&self) -> Option<&NodeId> {
        self.inner.transport.as_ref().map(|t| t.node_id())
    }

    pub fn is_clustered(&self) -> bool {
        self.inner.transport.is_some()
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    /// Number of local registrations at `address`, reply registrations
    /// included.
    pub fn handler_count(&self, address: &str) -> usize {
        self.inner.handlers.count(address)
    }

    /// Register a handler at `address`, advertised to the cluster.
    pub fn consumer<F>(&self, address: impl Into<String>, handler: F) -> Result<MessageConsumer, BusError>
    where
        F: FnMut(Message) -> anyhow::Result<()> + Send + 'static,
    {
        self.register(address.into(), Box::new(handler), false)
    }

    /// Register a handler visible to this node only.
    pub fn local_consumer<F>(&self, address: impl Into<String>, handler: F) -> Result<MessageConsumer, BusError>
    where
        F: FnMut(Message) -> anyhow::Result<()> + Send + 'static,
    {
        self.register(address.into(), Box::new(handler), true)
    }

    pub fn send<B>(&self, address: impl Into<String>, body: B) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
    {
        self.send_with(address, body, DeliveryOptions::default())
    }

    pub fn send_with<B>(&self, address: impl Into<String>, body: B, options: DeliveryOptions) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
    {
        self.check_open()?;
        self.route(Outgoing::new(address.into(), body, options, None, true), None)
    }

    /// Send to one handler and receive its reply, or the reason there is
    /// none, on the calling context.
    pub fn request<B, H>(&self, address: impl Into<String>, body: B, options: DeliveryOptions, handler: H) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
        H: FnOnce(Result<Message, ReplyError>) + Send + 'static,
    {
        self.check_open()?;
        let address = address.into();
        let context = self.current_context()?;
        let timeout = options.send_timeout.unwrap_or(self.inner.default_send_timeout);
        let holder = self.register_reply(&address, context, timeout, Box::new(handler));
        let outgoing = Outgoing::new(address, body, options, Some(holder.address.clone()), true);
        let routed = self.route(outgoing, Some(&holder));
        if routed.is_err() {
            self.discard_reply(&holder);
        }
        routed
    }

    pub fn publish<B>(&self, address: impl Into<String>, body: B) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
    {
        self.publish_with(address, body, DeliveryOptions::default())
    }

    pub fn publish_with<B>(&self, address: impl Into<String>, body: B, options: DeliveryOptions) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
    {
        self.check_open()?;
        self.route(Outgoing::new(address.into(), body, options, None, false), None)
    }

    /// Unregister every handler and refuse further traffic.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for holder in self.inner.handlers.drain() {
            if let Some(state) = holder.reply_state() {
                state.try_settle();
                state.cancel_timer();
            }
            if holder.is_advertised() {
                self.withdraw(&holder.address);
            }
            self.inner.metrics.handler_unregistered(holder.id);
        }
        self.inner.metrics.closed();
        crate::log_lifecycle!(
            "event_bus",
            self.node_id().map(NodeId::as_str).unwrap_or("local"),
            "closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    fn next_id(&self) -> RegistrationId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The calling context, or a fresh event loop context for callers
    /// outside the runtime.
    fn current_context(&self) -> Result<Context, BusError> {
        match Context::current() {
            Some(context) => Ok(context),
            None => Ok(self.inner.group.register_context()?),
        }
    }

    // --- Registration ---

    fn register(&self, address: String, handler: registry::ConsumerFn, local_only: bool) -> Result<MessageConsumer, BusError> {
        self.check_open()?;
        let context = self.current_context()?;
        let id = self.next_id();
        let holder = Arc::new(HandlerHolder::standing(id, address.clone(), context, handler, local_only));
        self.inner.handlers.insert(Arc::clone(&holder));
        self.inner.metrics.handler_registered(id, &address, None);

        let completion = Promise::new();
        match &self.inner.transport {
            Some(transport) if holder.is_advertised() => {
                let transport = Arc::clone(transport);
                let done = completion.clone();
                self.inner.timer.spawn(async move {
                    let result = transport.add_registration(&address).await.map_err(BusError::from);
                    done.complete(result);
                });
            }
            _ => {
                completion.complete(Ok(()));
            }
        }
        crate::log_bus!(holder.address.as_str(), "registered", id = id, local_only = local_only);
        Ok(MessageConsumer::new(self.clone(), holder, completion))
    }

    pub(crate) fn unregister(&self, holder: &Arc<HandlerHolder>) -> Promise<Result<(), BusError>> {
        if !self.inner.handlers.remove(holder) {
            return Promise::completed(Ok(()));
        }
        self.inner.metrics.handler_unregistered(holder.id);
        crate::log_bus!(holder.address.as_str(), "unregistered", id = holder.id);

        match &self.inner.transport {
            Some(transport) if holder.is_advertised() => {
                let done = Promise::new();
                let transport = Arc::clone(transport);
                let address = holder.address.clone();
                let result = done.clone();
                self.inner.timer.spawn(async move {
                    result.complete(transport.remove_registration(&address).await.map_err(BusError::from));
                });
                done
            }
            _ => Promise::completed(Ok(())),
        }
    }

    fn withdraw(&self, address: &str) {
        if let Some(transport) = &self.inner.transport {
            let transport = Arc::clone(transport);
            let address = address.to_string();
            self.inner.timer.spawn(async move {
                if let Err(e) = transport.remove_registration(&address).await {
                    crate::log_error!(e, address = address.as_str(), source = "withdraw");
                }
            });
        }
    }

    fn register_reply(&self, replied_address: &str, context: Context, timeout: Duration, handler: ReplyHandler) -> Arc<HandlerHolder> {
        let id = self.next_id();
        let reply_address = Uuid::new_v4().to_string();
        let state = ReplyState::new(replied_address.to_string(), timeout, handler);
        let holder = Arc::new(HandlerHolder::one_shot(id, reply_address.clone(), context, state));
        self.inner.handlers.insert(Arc::clone(&holder));
        self.inner.metrics.handler_registered(id, &reply_address, Some(replied_address));
        self.arm_timeout(&holder);
        holder
    }

    fn arm_timeout(&self, holder: &Arc<HandlerHolder>) {
        let Some(state) = holder.reply_state() else {
            return;
        };
        let timeout = state.timeout;
        let bus = self.clone();
        let target = Arc::clone(holder);
        let timer = self.inner.timer.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(state) = target.reply_state() else {
                return;
            };
            let address = state.replied_address.clone();
            bus.fail_reply_on_context(&target, ReplyError::Timeout { address: address.clone(), timeout }, address);
        });
        state.set_timer(timer.abort_handle());
    }

    /// Drop a reply registration that will never be answered.
    fn discard_reply(&self, holder: &Arc<HandlerHolder>) {
        if let Some(state) = holder.reply_state() {
            state.try_settle();
            state.cancel_timer();
        }
        if self.inner.handlers.remove(holder) {
            self.inner.metrics.handler_unregistered(holder.id);
        }
    }

    // --- Routing ---

    fn route(&self, outgoing: Outgoing, reply: Option<&Arc<HandlerHolder>>) -> Result<(), BusError> {
        let metrics = &self.inner.metrics;
        let locals = self.inner.handlers.lookup(&outgoing.address);
        let remotes = self.remote_nodes(&outgoing);

        if !outgoing.send {
            let envelope = if remotes.is_empty() { None } else { Some(self.encode(&outgoing)?) };
            metrics.message_sent(&outgoing.address, true, !locals.is_empty(), !remotes.is_empty());
            crate::log_bus!(
                outgoing.address.as_str(),
                "published",
                local_handlers = locals.len(),
                remote_nodes = remotes.len()
            );
            if let Some(envelope) = envelope {
                for node in remotes {
                    self.transmit(node, envelope.clone());
                }
            }
            if !locals.is_empty() {
                self.deliver_local(self.local_message(outgoing), locals);
            }
            return Ok(());
        }

        let total = locals.len() + remotes.len();
        if total == 0 {
            metrics.message_sent(&outgoing.address, false, false, false);
            crate::log_bus!(outgoing.address.as_str(), "no_handlers");
            if let Some(holder) = reply {
                let error = ReplyError::NoHandlers { address: outgoing.address.clone() };
                self.fail_reply_on_context(holder, error, outgoing.address);
            }
            return Ok(());
        }

        let pick = self.next_index(&outgoing.address, total);
        if pick < locals.len() {
            metrics.message_sent(&outgoing.address, false, true, false);
            let target = Arc::clone(&locals[pick]);
            self.deliver_local(self.local_message(outgoing), vec![target]);
        } else {
            let node = remotes[pick - locals.len()].clone();
            let envelope = self.encode(&outgoing)?;
            metrics.message_sent(&outgoing.address, false, false, true);
            self.transmit(node, envelope);
        }
        Ok(())
    }

    /// Other nodes holding `address`, sorted.
    fn remote_nodes(&self, outgoing: &Outgoing) -> Vec<NodeId> {
        if outgoing.options.local_only {
            return Vec::new();
        }
        let Some(transport) = &self.inner.transport else {
            return Vec::new();
        };
        let own = transport.node_id();
        let mut nodes: Vec<NodeId> = transport
            .nodes_for(&outgoing.address)
            .into_iter()
            .filter(|node| node != own)
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    fn next_index(&self, address: &str, total: usize) -> usize {
        if total <= 1 {
            return 0;
        }
        let mut cursors = self.inner.cursors.lock();
        let cursor = cursors.entry(address.to_string()).or_insert(0);
        let index = *cursor % total;
        *cursor = cursor.wrapping_add(1);
        index
    }

    fn local_message(&self, outgoing: Outgoing) -> Message {
        Message {
            address: outgoing.address,
            reply_address: outgoing.reply_address,
            headers: outgoing.options.headers,
            body: outgoing.body,
            send: outgoing.send,
            origin: None,
            bus: self.clone(),
        }
    }

    fn deliver_local(&self, template: Message, holders: Vec<Arc<HandlerHolder>>) {
        let local = template.origin.is_none();
        self.inner
            .metrics
            .message_received(&template.address, !template.send, local, holders.len());
        for holder in holders {
            let message = template.clone();
            self.inner.metrics.schedule_message(holder.id, local);
            let bus = self.clone();
            let target = Arc::clone(&holder);
            if let Err(e) = holder.context.run_on_context(move || bus.dispatch(target, message, local)) {
                crate::log_error!(e, address = holder.address.as_str(), source = "deliver");
            }
        }
    }

    /// Runs on the holder's context.
    fn dispatch(&self, holder: Arc<HandlerHolder>, message: Message, local: bool) {
        if holder.is_removed() {
            crate::log_bus!(holder.address.as_str(), "dropped", id = holder.id);
            return;
        }
        let metrics = &self.inner.metrics;
        match &holder.kind {
            HolderKind::Standing { .. } => {
                metrics.begin_handle_message(holder.id, local);
                let failure = holder.call(message);
                if let Some(error) = &failure {
                    tracing::warn!(address = holder.address.as_str(), error = %error, "message handler failed");
                }
                metrics.end_handle_message(holder.id, failure.as_ref());
            }
            HolderKind::OneShot(state) => {
                if !state.try_settle() {
                    return;
                }
                state.cancel_timer();
                let removed = self.inner.handlers.remove(&holder);
                metrics.begin_handle_message(holder.id, local);
                let outcome = match message.body::<ReplyException>() {
                    Some(exception) => {
                        let error = exception.clone().into_error(&state.replied_address);
                        metrics.reply_failure(&holder.address, error.failure_type());
                        Err(error)
                    }
                    None => Ok(message),
                };
                let failure = state.take_handler().and_then(|handler| call_reply_handler(handler, outcome));
                if let Some(error) = &failure {
                    tracing::warn!(address = holder.address.as_str(), error = %error, "reply handler failed");
                }
                metrics.end_handle_message(holder.id, failure.as_ref());
                if removed {
                    metrics.handler_unregistered(holder.id);
                }
            }
        }
    }

    fn fail_reply_on_context(&self, holder: &Arc<HandlerHolder>, error: ReplyError, metric_address: String) {
        let bus = self.clone();
        let target = Arc::clone(holder);
        if let Err(e) = holder
            .context
            .run_on_context(move || bus.fail_reply(&target, error, &metric_address))
        {
            crate::log_error!(e, address = holder.address.as_str(), source = "reply_failure");
        }
    }

    /// Settle a reply registration with a failure. Runs on the holder's
    /// context.
    fn fail_reply(&self, holder: &Arc<HandlerHolder>, error: ReplyError, metric_address: &str) {
        let Some(state) = holder.reply_state() else {
            return;
        };
        if !state.try_settle() {
            return;
        }
        state.cancel_timer();
        let removed = self.inner.handlers.remove(holder);
        self.inner.metrics.reply_failure(metric_address, error.failure_type());
        crate::log_bus!(metric_address, "reply_failed", failure = %error.failure_type());
        if let Some(handler) = state.take_handler() {
            if let Some(failure) = call_reply_handler(handler, Err(error)) {
                tracing::warn!(address = holder.address.as_str(), error = %failure, "reply handler failed");
            }
        }
        if removed {
            self.inner.metrics.handler_unregistered(holder.id);
        }
    }

    pub(crate) fn reply_to<B>(&self, message: &Message, body: B, options: DeliveryOptions, handler: Option<ReplyHandler>) -> Result<(), BusError>
    where
        B: Any + Send + Sync,
    {
        let Some(reply_address) = message.reply_address.clone() else {
            return Ok(());
        };
        self.check_open()?;
        let holder = match handler {
            Some(handler) => {
                let context = self.current_context()?;
                let timeout = options.send_timeout.unwrap_or(self.inner.default_send_timeout);
                Some(self.register_reply(&reply_address, context, timeout, handler))
            }
            None => None,
        };
        let outgoing = Outgoing::new(reply_address, body, options, holder.as_ref().map(|h| h.address.clone()), true);

        let result = match &message.origin {
            // Replies go straight back to the node the message came from.
            Some(node) => self.encode(&outgoing).map(|envelope| {
                self.inner.metrics.message_sent(&outgoing.address, false, false, true);
                self.transmit(node.clone(), envelope);
            }),
            None => self.route(outgoing, holder.as_ref()),
        };
        if result.is_err() {
            if let Some(holder) = &holder {
                self.discard_reply(holder);
            }
        }
        result
    }

    // --- Cluster ---

    fn encode(&self, outgoing: &Outgoing) -> Result<Envelope, BusError> {
        let transport = self.inner.transport.as_ref().ok_or(BusError::Transport(TransportError::Closed))?;
        let codec = self
            .inner
            .codecs
            .select(outgoing.options.codec_name.as_deref(), outgoing.body_type, outgoing.type_name)?;
        let body = codec.encode(&*outgoing.body)?;
        Ok(Envelope {
            address: outgoing.address.clone(),
            reply_address: outgoing.reply_address.clone(),
            headers: outgoing.options.headers.clone(),
            codec: codec.name().to_string(),
            body,
            send: outgoing.send,
            source: transport.node_id().clone(),
        })
    }

    fn transmit(&self, node: NodeId, envelope: Envelope) {
        let Some(transport) = self.inner.transport.clone() else {
            return;
        };
        self.inner.metrics.message_written(&envelope.address, envelope.body.len());
        self.inner.timer.spawn(async move {
            if let Err(e) = transport.send(&node, envelope).await {
                crate::log_error!(e, node = node.as_str(), source = "transmit");
            }
        });
    }

    fn receive_remote(&self, envelope: Envelope) {
        if self.is_closed() {
            return;
        }
        self.inner.metrics.message_read(&envelope.address, envelope.body.len());
        let body = match self.inner.codecs.decode(&envelope.codec, &envelope.body) {
            Ok(body) => body,
            Err(e) => {
                crate::log_error!(e, address = envelope.address.as_str(), source = "receive");
                return;
            }
        };
        let holders = self.inner.handlers.lookup(&envelope.address);
        let message = Message {
            address: envelope.address,
            reply_address: envelope.reply_address,
            headers: envelope.headers,
            body,
            send: envelope.send,
            origin: Some(envelope.source),
            bus: self.clone(),
        };

        if holders.is_empty() {
            self.inner.metrics.message_received(&message.address, !message.send, false, 0);
            crate::log_bus!(message.address.as_str(), "no_handlers", remote = true);
            if message.send && message.reply_address.is_some() {
                let exception = ReplyException::no_handlers(message.address.clone());
                if let Err(e) = self.reply_to(&message, exception, DeliveryOptions::default(), None) {
                    crate::log_error!(e, address = message.address.as_str(), source = "receive");
                }
            }
            return;
        }

        if message.send {
            let pick = self.next_index(&message.address, holders.len());
            let target = Arc::clone(&holders[pick]);
            self.deliver_local(message, vec![target]);
        } else {
            self.deliver_local(message, holders);
        }
    }
}

fn call_reply_handler(handler: ReplyHandler, outcome: Result<Message, ReplyError>) -> Option<anyhow::Error> {
    panic::catch_unwind(AssertUnwindSafe(move || handler(outcome)))
        .err()
        .map(|payload| anyhow::anyhow!("reply handler panicked: {}", panic_message(&*payload)))
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("node", &self.node_id())
            .field("closed", &self.is_closed())
            .field("codecs", &self.inner.codecs)
            .finish()
    }
}
