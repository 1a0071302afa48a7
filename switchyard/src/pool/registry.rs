use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchyard_api::metrics::{Metrics, PoolKind};

use super::worker_pool::{TaskHandle, WorkerPool};
use crate::context::Context;
use crate::error::{PoolError, TaskError};

struct Entry {
    pool: WorkerPool,
    refs: usize,
}

struct RegistryInner {
    pools: Mutex<HashMap<String, Entry>>,
    metrics: Arc<dyn Metrics>,
    default_size: usize,
    strict_sizes: bool,
}

/// Named, reference-counted worker pools.
///
/// The first acquisition of a name creates the pool; later ones share it.
/// When the last holder releases, the pool is closed and the name becomes
/// free again.
#[derive(Clone)]
pub struct SharedPoolRegistry {
    inner: Arc<RegistryInner>,
}

impl SharedPoolRegistry {
    pub fn new(metrics: Arc<dyn Metrics>, default_size: usize, strict_sizes: bool) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pools: Mutex::new(HashMap::new()),
                metrics,
                default_size,
                strict_sizes,
            }),
        }
    }

    /// Acquire the shared pool called `name`, creating it with `size`
    /// threads (or the default size) if it does not exist.
    ///
    /// For an existing pool the requested size is ignored, unless the
    /// registry was built with strict sizes and the sizes differ.
    pub fn acquire(&self, name: &str, size: Option<usize>) -> Result<WorkerExecutor, PoolError> {
        self.acquire_kind(name, size, PoolKind::Shared)
    }

    pub(crate) fn acquire_kind(&self, name: &str, size: Option<usize>, kind: PoolKind) -> Result<WorkerExecutor, PoolError> {
        let mut pools = self.inner.pools.lock();
        if let Some(entry) = pools.get_mut(name) {
            if let Some(requested) = size {
                if self.inner.strict_sizes && requested != entry.pool.size() {
                    return Err(PoolError::SizeConflict {
                        name: name.to_string(),
                        existing: entry.pool.size(),
                        requested,
                    });
                }
            }
            entry.refs += 1;
            crate::log_scheduler!("shared_pools", "acquired", pool = name, refs = entry.refs);
            return Ok(WorkerExecutor::new(self.clone(), entry.pool.clone()));
        }

        let size = size.unwrap_or(self.inner.default_size);
        let pool = WorkerPool::new(name, size, kind, self.inner.metrics.as_ref())?;
        pools.insert(name.to_string(), Entry { pool: pool.clone(), refs: 1 });
        crate::log_scheduler!("shared_pools", "created", pool = name, size = size);
        Ok(WorkerExecutor::new(self.clone(), pool))
    }

    /// Drop one reference to `pool`. Returns `true` if the pool was closed.
    ///
    /// Only the entry that still holds this exact pool is touched, so a
    /// reference to a pool that was already torn down can never release a
    /// newer pool registered under the same name.
    pub(crate) fn release(&self, pool: &WorkerPool) -> Result<bool, PoolError> {
        let name = pool.name();
        let closing = {
            let mut pools = self.inner.pools.lock();
            let entry = pools
                .get_mut(name)
                .filter(|entry| entry.pool.ptr_eq(pool))
                .ok_or_else(|| PoolError::AlreadyClosed(name.to_string()))?;
            entry.refs -= 1;
            crate::log_scheduler!("shared_pools", "released", pool = name, refs = entry.refs);
            if entry.refs == 0 {
                pools.remove(name).map(|e| e.pool)
            } else {
                None
            }
        };
        match closing {
            Some(pool) => {
                pool.close();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The live pool registered under `name`.
    pub fn pool(&self, name: &str) -> Option<WorkerPool> {
        self.inner.pools.lock().get(name).map(|e| e.pool.clone())
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.inner.pools.lock().get(name).map_or(0, |e| e.refs)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.pools.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SharedPoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPoolRegistry").field("pools", &self.names()).finish()
    }
}

/// One holder's reference to a shared pool.
///
/// Closing (or dropping) the executor releases the reference exactly once;
/// the pool itself closes when its last executor does.
pub struct WorkerExecutor {
    registry: SharedPoolRegistry,
    pool: WorkerPool,
    released: AtomicBool,
}

impl WorkerExecutor {
    fn new(registry: SharedPoolRegistry, pool: WorkerPool) -> Self {
        Self { registry, pool, released: AtomicBool::new(false) }
    }

    pub fn name(&self) -> &str {
        self.pool.name()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run `blocking` on the shared pool. The handler runs on the calling
    /// context, or on the worker thread when called off-context.
    pub fn execute_blocking<T, F, H>(&self, blocking: F, handler: H)
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        H: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        if self.is_closed() {
            handler(Err(TaskError::Rejected(format!("executor `{}` is closed", self.name()))));
            return;
        }
        match Context::current() {
            Some(context) => context.execute_blocking_on(&self.pool, blocking, handler),
            None => {
                let handler = Arc::new(Mutex::new(Some(handler)));
                let job_handler = Arc::clone(&handler);
                let submitted = self.pool.execute(move || {
                    let result = super::run_catching(blocking);
                    if let Some(handler) = job_handler.lock().take() {
                        handler(result);
                    }
                });
                if let Err(e) = submitted {
                    if let Some(handler) = handler.lock().take() {
                        handler(Err(TaskError::Rejected(e.to_string())));
                    }
                }
            }
        }
    }

    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::AlreadyClosed(self.name().to_string()));
        }
        self.pool.submit(f)
    }

    /// Release this holder's reference. Later calls are no-ops.
    pub fn close(&self) -> Result<(), PoolError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.registry.release(&self.pool).map(|_| ())
    }

    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            crate::log_error!(e, pool = self.pool.name());
        }
    }
}

impl std::fmt::Debug for WorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerExecutor")
            .field("pool", &self.pool.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
