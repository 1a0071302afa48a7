//! # Execution Contexts
//!
//! A [`Context`] is the unit of execution affinity. Everything submitted to
//! one context runs sequentially and in submission order, either on the
//! single thread of an event loop or serialized onto a worker pool.
//!
//! While a callback runs, [`Context::current`] returns the context that
//! dispatched it. This is how the event bus knows where a handler or a
//! reply handler must be invoked, and how blocking results find their way
//! back to the caller.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LoopError, TaskError};
use crate::event_loop::EventLoop;
use crate::pool::{run_catching, WorkerPool};
use crate::Task;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

enum Affinity {
    EventLoop(EventLoop),
    Worker(WorkerSlot),
}

/// Serializes the callbacks of one worker context onto a shared pool.
struct WorkerSlot {
    pool: WorkerPool,
    queue: Mutex<SlotQueue>,
}

struct SlotQueue {
    tasks: VecDeque<Task>,
    running: bool,
}

struct ContextInner {
    id: u64,
    affinity: Affinity,
    blocking_pool: Option<WorkerPool>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// Restores the previous current context, even if the callback panics.
struct CurrentGuard {
    previous: Option<Context>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

impl Context {
    pub(crate) fn on_event_loop(event_loop: EventLoop, blocking_pool: Option<WorkerPool>) -> Self {
        Self::build(Affinity::EventLoop(event_loop), blocking_pool)
    }

    pub(crate) fn on_worker_pool(pool: WorkerPool) -> Self {
        let blocking_pool = Some(pool.clone());
        Self::build(
            Affinity::Worker(WorkerSlot {
                pool,
                queue: Mutex::new(SlotQueue { tasks: VecDeque::new(), running: false }),
            }),
            blocking_pool,
        )
    }

    fn build(affinity: Affinity, blocking_pool: Option<WorkerPool>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                affinity,
                blocking_pool,
            }),
        }
    }

    /// The context whose callback is running on this thread, if any.
    pub fn current() -> Option<Context> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_event_loop_context(&self) -> bool {
        matches!(self.inner.affinity, Affinity::EventLoop(_))
    }

    pub fn is_worker_context(&self) -> bool {
        matches!(self.inner.affinity, Affinity::Worker(_))
    }

    /// The loop this context is pinned to, for event loop contexts.
    pub fn event_loop(&self) -> Option<&EventLoop> {
        match &self.inner.affinity {
            Affinity::EventLoop(event_loop) => Some(event_loop),
            Affinity::Worker(_) => None,
        }
    }

    /// Whether the calling thread is currently running a callback of this
    /// context.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current.borrow().as_ref().is_some_and(|c| c == self))
    }

    /// Queue `f` to run on this context. Always asynchronous, even when
    /// called from the context itself.
    pub fn run_on_context<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.wrap(f);
        match &self.inner.affinity {
            Affinity::EventLoop(event_loop) => event_loop.execute(task),
            Affinity::Worker(slot) => {
                let start = {
                    let mut queue = slot.queue.lock();
                    queue.tasks.push_back(task);
                    !std::mem::replace(&mut queue.running, true)
                };
                if start {
                    self.submit_next(slot)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Run `blocking` on this context's blocking pool and deliver the
    /// outcome to `handler` back on this context.
    pub fn execute_blocking<T, F, H>(&self, blocking: F, handler: H)
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        H: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        match self.inner.blocking_pool.clone() {
            Some(pool) => self.execute_blocking_on(&pool, blocking, handler),
            None => self.deliver(handler, Err(TaskError::Rejected("context has no worker pool".to_string()))),
        }
    }

    /// Like [`execute_blocking`](Self::execute_blocking), on an explicit pool.
    pub fn execute_blocking_on<T, F, H>(&self, pool: &WorkerPool, blocking: F, handler: H)
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        H: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        // Shared with the job so a rejected submission can still report.
        let handler = Arc::new(Mutex::new(Some(handler)));
        let job_handler = Arc::clone(&handler);
        let context = self.clone();
        let submitted = pool.execute_job(Box::new(move || {
            let result = run_catching(blocking);
            let succeeded = result.is_ok();
            if let Some(handler) = job_handler.lock().take() {
                context.deliver(handler, result);
            }
            succeeded
        }));
        if let Err(e) = submitted {
            if let Some(handler) = handler.lock().take() {
                self.deliver(handler, Err(TaskError::Rejected(e.to_string())));
            }
        }
    }

    fn deliver<T, H>(&self, handler: H, result: Result<T, TaskError>)
    where
        T: Send + 'static,
        H: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        if let Err(e) = self.run_on_context(move || handler(result)) {
            crate::log_error!(e, context = self.inner.id, source = "blocking_result");
        }
    }

    fn wrap<F>(&self, f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self.clone();
        Box::new(move || {
            let previous = CURRENT.with(|current| current.borrow_mut().replace(context));
            let _guard = CurrentGuard { previous };
            f();
        })
    }

    fn submit_next(&self, slot: &WorkerSlot) -> Result<(), LoopError> {
        let context = self.clone();
        let submitted = slot.pool.execute_job(Box::new(move || {
            context.drain_one();
            true
        }));
        if let Err(e) = submitted {
            let dropped = {
                let mut queue = slot.queue.lock();
                queue.running = false;
                std::mem::take(&mut queue.tasks).len()
            };
            crate::log_scheduler!(
                "worker_context",
                "rejected",
                context = self.inner.id,
                dropped = dropped
            );
            return Err(LoopError::Rejected(e.to_string()));
        }
        Ok(())
    }

    /// Run one queued callback, then hand the slot back to the pool if more
    /// are waiting.
    fn drain_one(&self) {
        let Affinity::Worker(slot) = &self.inner.affinity else {
            return;
        };
        let task = slot.queue.lock().tasks.pop_front();
        if let Some(task) = task {
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
                crate::log_error!(
                    crate::error::panic_message(&*payload),
                    context = self.inner.id,
                    source = "worker_context"
                );
            }
        }
        let more = {
            let mut queue = slot.queue.lock();
            if queue.tasks.is_empty() {
                queue.running = false;
                false
            } else {
                true
            }
        };
        if more {
            if let Err(e) = self.submit_next(slot) {
                crate::log_error!(e, context = self.inner.id, source = "worker_context");
            }
        }
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let affinity = match &self.inner.affinity {
            Affinity::EventLoop(event_loop) => event_loop.name().to_string(),
            Affinity::Worker(slot) => format!("worker:{}", slot.pool.name()),
        };
        f.debug_struct("Context").field("id", &self.inner.id).field("affinity", &affinity).finish()
    }
}
