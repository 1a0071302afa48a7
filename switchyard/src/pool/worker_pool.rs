use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchyard_api::metrics::{Metrics, PoolKind, PoolMetrics};
use tokio::sync::oneshot;

use crate::error::{panic_message, PoolError, TaskError};

/// A queued unit of work; returns whether it succeeded.
pub(crate) type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

struct QueuedJob {
    job: Job,
    queued_at: Instant,
}

/// Live counters of a pool.
///
/// `submitted == completed + running + waiting` once the pool is quiescent,
/// and `idle + running` never exceeds the pool size.
#[derive(Debug, Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    running: AtomicUsize,
    idle: AtomicUsize,
    waiting: AtomicUsize,
}

/// Point-in-time copy of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    pub size: usize,
    pub submitted: u64,
    pub completed: u64,
    pub running: usize,
    pub idle: usize,
    pub waiting: usize,
}

struct PoolInner {
    name: String,
    size: usize,
    kind: PoolKind,
    sender: Mutex<Option<flume::Sender<QueuedJob>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    closed: AtomicBool,
    metrics: Arc<dyn PoolMetrics>,
}

/// Fixed-size pool of named OS threads consuming one FIFO queue.
///
/// Clones share the same threads and queue. Closing stops intake, lets the
/// queued work drain and then lets the threads exit.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize, kind: PoolKind, metrics: &dyn Metrics) -> Result<Self, PoolError> {
        let name = name.into();
        let size = size.max(1);
        let pool_metrics = metrics.create_pool_metrics(kind, &name, size);
        let stats = Arc::new(PoolStats::default());
        stats.idle.store(size, Ordering::Release);
        let (tx, rx) = flume::unbounded::<QueuedJob>();

        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            let rx = rx.clone();
            let stats = Arc::clone(&stats);
            let metrics = Arc::clone(&pool_metrics);
            let thread = std::thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(rx, stats, metrics))
                .map_err(|e| PoolError::Spawn(format!("{name}: {e}")))?;
            threads.push(thread);
        }

        crate::log_lifecycle!("worker_pool", name.as_str(), "started", size = size, kind = ?kind);

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                size,
                kind,
                sender: Mutex::new(Some(tx)),
                threads: Mutex::new(threads),
                stats,
                closed: AtomicBool::new(false),
                metrics: pool_metrics,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    /// Queue a fire-and-forget job.
    pub fn execute<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_job(Box::new(move || {
            f();
            true
        }))
    }

    /// Queue `f` and get a handle to its outcome.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute_job(Box::new(move || {
            let result = run_catching(f);
            let succeeded = result.is_ok();
            let _ = tx.send(result);
            succeeded
        }))?;
        Ok(TaskHandle { rx })
    }

    pub(crate) fn execute_job(&self, job: Job) -> Result<(), PoolError> {
        let sender = self.inner.sender.lock();
        let tx = sender
            .as_ref()
            .ok_or_else(|| PoolError::AlreadyClosed(self.inner.name.clone()))?;

        let stats = &self.inner.stats;
        stats.submitted.fetch_add(1, Ordering::AcqRel);
        stats.waiting.fetch_add(1, Ordering::AcqRel);
        self.inner.metrics.submitted();

        tx.send(QueuedJob { job, queued_at: Instant::now() }).map_err(|_| {
            stats.waiting.fetch_sub(1, Ordering::AcqRel);
            stats.submitted.fetch_sub(1, Ordering::AcqRel);
            PoolError::AlreadyClosed(self.inner.name.clone())
        })
    }

    /// Stop accepting work. Queued jobs still run. Returns `true` for the
    /// call that actually closed the pool.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Dropping the sender lets the workers exit once the queue is empty.
        self.inner.sender.lock().take();
        self.inner.metrics.closed();
        crate::log_lifecycle!("worker_pool", self.inner.name.as_str(), "closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Join the worker threads of a closed pool, waiting at most `timeout`.
    ///
    /// Threads of this pool never join themselves; calling this from a pool
    /// thread only waits for the others.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let current = std::thread::current().id();
        loop {
            let pending = {
                let mut threads = self.inner.threads.lock();
                threads.retain(|t| !t.is_finished() && t.thread().id() != current);
                threads.len()
            };
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let stats = &self.inner.stats;
        PoolSnapshot {
            size: self.inner.size,
            submitted: stats.submitted.load(Ordering::Acquire),
            completed: stats.completed.load(Ordering::Acquire),
            running: stats.running.load(Ordering::Acquire),
            idle: stats.idle.load(Ordering::Acquire),
            waiting: stats.waiting.load(Ordering::Acquire),
        }
    }

    /// Whether both handles refer to the same pool.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("closed", &self.is_closed())
            .field("stats", &self.snapshot())
            .finish()
    }
}

fn worker_loop(rx: flume::Receiver<QueuedJob>, stats: Arc<PoolStats>, metrics: Arc<dyn PoolMetrics>) {
    while let Ok(queued) = rx.recv() {
        // idle drops before running rises, and the reverse at the end, so
        // idle + running stays within the pool size.
        stats.idle.fetch_sub(1, Ordering::AcqRel);
        stats.running.fetch_add(1, Ordering::AcqRel);
        stats.waiting.fetch_sub(1, Ordering::AcqRel);
        metrics.begin(queued.queued_at.elapsed());

        let started = Instant::now();
        let succeeded = match panic::catch_unwind(AssertUnwindSafe(queued.job)) {
            Ok(succeeded) => succeeded,
            Err(payload) => {
                crate::log_error!(panic_message(&*payload), source = "worker_pool");
                false
            }
        };

        stats.completed.fetch_add(1, Ordering::AcqRel);
        stats.running.fetch_sub(1, Ordering::AcqRel);
        stats.idle.fetch_add(1, Ordering::AcqRel);
        metrics.end(succeeded, started.elapsed());
    }
}

/// Run a fallible task, turning errors and panics into a [`TaskError`].
pub(crate) fn run_catching<T, F>(f: F) -> Result<T, TaskError>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(TaskError::Failed(Arc::new(error))),
        Err(payload) => Err(TaskError::Panicked(panic_message(&*payload))),
    }
}

/// Outcome of a task submitted with [`WorkerPool::submit`].
///
/// Await it from async code, or [`join`](Self::join) it from a plain thread.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes. Must not be called from async code.
    pub fn join(self) -> Result<T, TaskError> {
        self.rx.blocking_recv().unwrap_or(Err(TaskError::Cancelled))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| result.unwrap_or(Err(TaskError::Cancelled)))
    }
}
