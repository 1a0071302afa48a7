//! # Event Loops
//!
//! An [`EventLoop`] is one OS thread driving a current-thread tokio runtime.
//! Tasks submitted with [`EventLoop::execute`] run strictly in submission
//! order on that thread; timers scheduled with [`EventLoop::schedule`] fire
//! on the same thread, interleaved between tasks.
//!
//! ## Lifecycle
//! 1. `Running`: tasks are accepted and executed
//! 2. `ShuttingDown`: graceful shutdown requested. Tasks are still accepted;
//!    the loop exits once no task arrived for a full quiet period, or when
//!    the shutdown timeout elapses
//! 3. `Shutdown`: forced shutdown requested; new tasks are rejected, the loop
//!    exits after the task it is currently running
//! 4. `Terminated`: the thread has left its run loop and the termination
//!    promise is complete
//!
//! Loops are grouped and handed out round-robin by [`EventLoopGroup`].

mod group;

pub use group::{Channel, EventLoopGroup};

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchyard_api::metrics::Metrics;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;

use crate::completion::Promise;
use crate::error::{panic_message, LoopError};
use crate::Task;

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const SHUTDOWN: u8 = 2;
const TERMINATED: u8 = 3;

/// Status of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Running,
    ShuttingDown,
    Shutdown,
    Terminated,
}

enum Command {
    Run(Task),
    Wakeup,
}

#[derive(Clone, Copy)]
struct GracefulShutdown {
    quiet_period: Duration,
    deadline: Instant,
}

/// State shared between the handles and the loop thread.
///
/// The loop thread holds only this part, so dropping every handle
/// disconnects the command channel and lets the thread exit.
struct LoopShared {
    state: AtomicU8,
    graceful: Mutex<Option<GracefulShutdown>>,
    termination: Promise<()>,
}

struct EventLoopInner {
    name: String,
    tx: flume::Sender<Command>,
    shared: Arc<LoopShared>,
    runtime: Handle,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a single-threaded event loop.
///
/// Handles are cheap to clone; equality is identity of the underlying loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<EventLoopInner>,
}

/// Cancels a timer scheduled on an event loop.
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl EventLoop {
    /// Start a new event loop thread called `name`.
    pub fn spawn(name: impl Into<String>, metrics: &dyn Metrics) -> Result<Self, LoopError> {
        let name = name.into();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LoopError::Spawn(format!("{name}: {e}")))?;
        let handle = runtime.handle().clone();
        let (tx, rx) = flume::unbounded();
        let shared = Arc::new(LoopShared {
            state: AtomicU8::new(RUNNING),
            graceful: Mutex::new(None),
            termination: Promise::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(runtime, rx, thread_shared, thread_name))
            .map_err(|e| LoopError::Spawn(format!("{name}: {e}")))?;
        let thread_id = thread.thread().id();

        metrics.event_loop_created(&name);
        crate::log_lifecycle!("event_loop", name.as_str(), "started");

        Ok(Self {
            inner: Arc::new(EventLoopInner {
                name,
                tx,
                shared,
                runtime: handle,
                thread_id,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `task` behind every task already submitted.
    pub fn execute(&self, task: Task) -> Result<(), LoopError> {
        if self.inner.shared.state.load(Ordering::Acquire) >= SHUTDOWN {
            return Err(LoopError::Rejected(self.inner.name.clone()));
        }
        self.inner
            .tx
            .send(Command::Run(task))
            .map_err(|_| LoopError::Rejected(self.inner.name.clone()))
    }

    /// Run `task` on this loop once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, task: Task) -> Result<TimerHandle, LoopError> {
        if self.inner.shared.state.load(Ordering::Acquire) >= SHUTDOWN {
            return Err(LoopError::Rejected(self.inner.name.clone()));
        }
        let join = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            run_task(task);
        });
        Ok(TimerHandle { abort: join.abort_handle() })
    }

    /// Whether the calling thread is this loop's thread.
    pub fn in_event_loop(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// Number of tasks queued and not yet started.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tx.len()
    }

    pub fn status(&self) -> LoopStatus {
        match self.inner.shared.state.load(Ordering::Acquire) {
            RUNNING => LoopStatus::Running,
            SHUTTING_DOWN => LoopStatus::ShuttingDown,
            SHUTDOWN => LoopStatus::Shutdown,
            _ => LoopStatus::Terminated,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shared.state.load(Ordering::Acquire) >= SHUTTING_DOWN
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.shared.termination.is_complete()
    }

    /// Request an immediate stop. The task currently running is not
    /// interrupted; queued tasks are discarded.
    pub fn shutdown(&self) {
        let previous = self.inner.shared.state.fetch_max(SHUTDOWN, Ordering::AcqRel);
        if previous < SHUTDOWN {
            crate::log_lifecycle!("event_loop", self.inner.name.as_str(), "shutdown");
            let _ = self.inner.tx.send(Command::Wakeup);
        }
    }

    /// Request a graceful stop and return the termination promise.
    ///
    /// Calling this again, or after `shutdown`, returns the same promise.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()> {
        let shared = &self.inner.shared;
        if shared
            .state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *shared.graceful.lock() = Some(GracefulShutdown {
                quiet_period,
                deadline: Instant::now() + timeout,
            });
            crate::log_lifecycle!(
                "event_loop",
                self.inner.name.as_str(),
                "shutting_down",
                quiet_period_ms = quiet_period.as_millis() as u64
            );
            let _ = self.inner.tx.send(Command::Wakeup);
        }
        shared.termination.clone()
    }

    pub fn termination(&self) -> Promise<()> {
        self.inner.shared.termination.clone()
    }

    /// Block until the loop thread has exited or `timeout` elapses.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.shared.termination.wait_timeout(timeout).is_some()
    }

    /// Join the loop thread once it has terminated. A no-op when called from
    /// the loop thread itself or when already joined.
    pub fn join(&self) {
        if self.in_event_loop() {
            return;
        }
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                crate::log_error!("event loop thread panicked", event_loop = self.inner.name.as_str());
            }
        }
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventLoop {}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

fn run_loop(runtime: Runtime, rx: flume::Receiver<Command>, shared: Arc<LoopShared>, name: String) {
    runtime.block_on(async {
        loop {
            if shared.state.load(Ordering::Acquire) >= SHUTDOWN {
                break;
            }
            let graceful = *shared.graceful.lock();
            let command = match graceful {
                None => match rx.recv_async().await {
                    Ok(command) => command,
                    Err(_) => break,
                },
                Some(graceful) => {
                    let now = Instant::now();
                    if now >= graceful.deadline {
                        break;
                    }
                    let wait = graceful.quiet_period.min(graceful.deadline - now);
                    match tokio::time::timeout(wait, rx.recv_async()).await {
                        Ok(Ok(command)) => command,
                        // Channel closed, or a whole quiet period without work.
                        Ok(Err(_)) | Err(_) => break,
                    }
                }
            };
            if let Command::Run(task) = command {
                run_task(task);
                // Let timers spawned on this runtime make progress between tasks.
                tokio::task::yield_now().await;
            }
        }
    });
    // Dropping the runtime cancels timers that have not fired.
    drop(runtime);
    shared.state.store(TERMINATED, Ordering::Release);
    crate::log_lifecycle!("event_loop", name.as_str(), "terminated");
    shared.termination.complete(());
}

fn run_task(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        crate::log_error!(panic_message(&*payload), source = "event_loop_task");
    }
}
