//! # Worker Pools
//!
//! Fixed-size pools of OS threads for blocking work, and the registry that
//! shares named pools between their holders.

mod registry;
mod worker_pool;

pub use registry::{SharedPoolRegistry, WorkerExecutor};
pub use worker_pool::{PoolSnapshot, TaskHandle, WorkerPool};

pub(crate) use worker_pool::run_catching;
