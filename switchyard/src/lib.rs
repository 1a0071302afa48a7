// Switchyard runtime
//
// Implements the execution and messaging core on top of the interfaces in
// `switchyard-api`: event loops and groups, execution contexts, worker
// pools, the event bus and an in-process cluster transport.

pub mod bus;
pub mod cluster;
pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod pool;
pub mod system;

/// A unit of work queued on an event loop or a context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

// Re-export commonly used types
pub use bus::{EventBus, JsonCodec, Message, MessageConsumer, ReplyException};
pub use cluster::{InMemoryCluster, InMemoryTransport};
pub use completion::Promise;
pub use config::{DeliveryOptions, SwitchyardConfig};
pub use context::Context;
pub use error::{BusError, GroupError, LoopError, PoolError, SystemError, TaskError};
pub use event_loop::{Channel, EventLoop, EventLoopGroup, TimerHandle};
pub use pool::{SharedPoolRegistry, TaskHandle, WorkerExecutor, WorkerPool};
pub use switchyard_api::errors::{ReplyError, ReplyFailure};
pub use system::Switchyard;
