//! # Switchyard Runtime
//!
//! [`Switchyard`] owns everything the other modules need at run time: the
//! event loops and their group, the default worker pool, the internal
//! blocking pool, the shared pool registry, the timer thread and the event
//! bus.
//!
//! ## Threads
//! - `switchyard-eventloop-thread-N`: one per configured event loop
//! - `switchyard-worker-thread-N`: the default worker pool
//! - `switchyard-internal-blocking-N`: blocking work of the runtime itself
//! - `switchyard-timer`: reply timeouts and cluster I/O
//!
//! ## Shutdown
//! [`Switchyard::close`] closes the bus, shuts the loops down gracefully and,
//! once they have terminated, releases the internal pools and stops the
//! timer thread. Shared pools acquired by callers stay open until their
//! executors are closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchyard_api::cluster::ClusterTransport;
use switchyard_api::metrics::PoolKind;
use tokio::runtime::{Builder, Runtime};

use crate::bus::EventBus;
use crate::completion::Promise;
use crate::config::{SwitchyardConfig, INTERNAL_BLOCKING_POOL_NAME, WORKER_POOL_NAME};
use crate::context::Context;
use crate::error::{GroupError, PoolError, SystemError, TaskError};
use crate::event_loop::{EventLoop, EventLoopGroup};
use crate::pool::{SharedPoolRegistry, WorkerExecutor, WorkerPool};

struct SwitchyardInner {
    config: SwitchyardConfig,
    event_loops: Vec<EventLoop>,
    group: EventLoopGroup,
    pools: SharedPoolRegistry,
    worker: WorkerExecutor,
    internal_blocking: WorkerExecutor,
    event_bus: EventBus,
    timer: Mutex<Option<Runtime>>,
    closed: AtomicBool,
    close_done: Promise<()>,
}

/// Handle to a running Switchyard runtime. Clones share the runtime.
#[derive(Clone)]
pub struct Switchyard {
    inner: Arc<SwitchyardInner>,
}

impl Switchyard {
    /// Start a standalone runtime.
    pub fn new(config: SwitchyardConfig) -> Result<Self, SystemError> {
        Self::build(config, None)
    }

    /// Start a runtime whose event bus spans the cluster behind `transport`.
    pub fn clustered(config: SwitchyardConfig, transport: Arc<dyn ClusterTransport>) -> Result<Self, SystemError> {
        Self::build(config, Some(transport))
    }

    fn build(config: SwitchyardConfig, transport: Option<Arc<dyn ClusterTransport>>) -> Result<Self, SystemError> {
        config.validate().map_err(SystemError::ConfigError)?;

        let timer = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("switchyard-timer")
            .enable_all()
            .build()
            .map_err(|e| SystemError::ThreadSetupError(e.to_string()))?;

        let pools = SharedPoolRegistry::new(
            Arc::clone(&config.metrics),
            config.worker_pool_size,
            config.strict_shared_pool_sizes,
        );
        let worker = pools.acquire_kind(WORKER_POOL_NAME, Some(config.worker_pool_size), PoolKind::Worker)?;
        let internal_blocking = pools.acquire_kind(
            INTERNAL_BLOCKING_POOL_NAME,
            Some(config.internal_blocking_pool_size),
            PoolKind::InternalBlocking,
        )?;

        let group = EventLoopGroup::with_blocking_pool(worker.pool().clone());
        let mut event_loops = Vec::with_capacity(config.event_loop_pool_size);
        for index in 0..config.event_loop_pool_size {
            let event_loop = EventLoop::spawn(
                format!("switchyard-eventloop-thread-{index}"),
                config.metrics.as_ref(),
            )?;
            group.add_worker(event_loop.clone());
            event_loops.push(event_loop);
        }

        let event_bus = EventBus::new(
            group.clone(),
            timer.handle().clone(),
            config.metrics.as_ref(),
            config.default_send_timeout,
            transport,
        );

        crate::log_lifecycle!(
            "switchyard",
            event_bus.node_id().map(|n| n.as_str()).unwrap_or("local"),
            "started",
            event_loops = event_loops.len(),
            worker_pool_size = config.worker_pool_size
        );

        Ok(Self {
            inner: Arc::new(SwitchyardInner {
                config,
                event_loops,
                group,
                pools,
                worker,
                internal_blocking,
                event_bus,
                timer: Mutex::new(Some(timer)),
                closed: AtomicBool::new(false),
                close_done: Promise::new(),
            }),
        })
    }

    pub fn config(&self) -> &SwitchyardConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn event_loop_group(&self) -> &EventLoopGroup {
        &self.inner.group
    }

    /// The runtime's own loops, in creation order.
    pub fn event_loops(&self) -> &[EventLoop] {
        &self.inner.event_loops
    }

    pub fn shared_pools(&self) -> &SharedPoolRegistry {
        &self.inner.pools
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        self.inner.worker.pool()
    }

    pub fn internal_blocking_pool(&self) -> &WorkerPool {
        self.inner.internal_blocking.pool()
    }

    /// The calling context, or a new event loop context when called from
    /// outside the runtime.
    pub fn get_or_create_context(&self) -> Result<Context, GroupError> {
        match Context::current() {
            Some(context) => Ok(context),
            None => self.inner.group.register_context(),
        }
    }

    /// A new context pinned to the next event loop.
    pub fn create_event_loop_context(&self) -> Result<Context, GroupError> {
        self.inner.group.register_context()
    }

    /// A new context whose callbacks run, one at a time, on the worker pool.
    pub fn create_worker_context(&self) -> Context {
        Context::on_worker_pool(self.worker_pool().clone())
    }

    pub fn run_on_context<F>(&self, f: F) -> Result<(), SystemError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_open()?;
        self.get_or_create_context()?.run_on_context(f)?;
        Ok(())
    }

    /// Run `blocking` on the worker pool; `handler` runs on the calling
    /// context.
    pub fn execute_blocking<T, F, H>(&self, blocking: F, handler: H) -> Result<(), SystemError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        H: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        self.ensure_open()?;
        self.get_or_create_context()?.execute_blocking_on(self.worker_pool(), blocking, handler);
        Ok(())
    }

    /// Like [`execute_blocking`](Self::execute_blocking), on the pool
    /// reserved for the runtime's own blocking work.
    pub fn execute_internal_blocking<T, F, H>(&self, blocking: F, handler: H) -> Result<(), SystemError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        H: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        self.ensure_open()?;
        self.get_or_create_context()?
            .execute_blocking_on(self.internal_blocking_pool(), blocking, handler);
        Ok(())
    }

    /// Acquire the named shared pool.
    pub fn create_shared_worker_executor(&self, name: &str, size: Option<usize>) -> Result<WorkerExecutor, PoolError> {
        self.inner.pools.acquire(name, size)
    }

    /// Shut the runtime down. Every call returns the same promise, which
    /// completes once the event loops have terminated and the internal pools
    /// are released.
    pub fn close(&self) -> Promise<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return self.inner.close_done.clone();
        }
        crate::log_lifecycle!("switchyard", "runtime", "closing");
        self.inner.event_bus.close();

        let termination = self
            .inner
            .group
            .shutdown_gracefully(self.inner.config.shutdown_quiet_period, self.inner.config.shutdown_timeout);
        let inner = Arc::clone(&self.inner);
        termination.on_complete(move |_| inner.finish_close());
        self.inner.close_done.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), SystemError> {
        if self.is_closed() {
            return Err(SystemError::Closed);
        }
        Ok(())
    }
}

impl SwitchyardInner {
    fn finish_close(&self) {
        for executor in [&self.worker, &self.internal_blocking] {
            if let Err(e) = executor.close() {
                crate::log_error!(e, pool = executor.name(), source = "close");
            }
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.shutdown_background();
        }
        crate::log_lifecycle!("switchyard", "runtime", "closed");
        self.close_done.complete(());
    }
}

impl Drop for SwitchyardInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Switchyard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchyard")
            .field("event_loops", &self.inner.event_loops.len())
            .field("event_bus", &self.inner.event_bus)
            .field("closed", &self.is_closed())
            .finish()
    }
}
