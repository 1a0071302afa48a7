use std::sync::Arc;
use std::time::Duration;

use switchyard_api::metrics::{Metrics, NoopMetrics};
use switchyard_api::types::Headers;

pub const DEFAULT_WORKER_POOL_SIZE: usize = 20;
pub const DEFAULT_INTERNAL_BLOCKING_POOL_SIZE: usize = 20;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub const WORKER_POOL_NAME: &str = "switchyard-worker-thread";
pub const INTERNAL_BLOCKING_POOL_NAME: &str = "switchyard-internal-blocking";

// --- Runtime Configuration ---

/// Configuration for a [`Switchyard`](crate::system::Switchyard) runtime.
#[derive(Clone, Debug)]
pub struct SwitchyardConfig {
    /// Number of event loop threads.
    pub event_loop_pool_size: usize,

    /// Threads in the default worker pool.
    pub worker_pool_size: usize,

    /// Threads in the pool reserved for the runtime's own blocking work.
    pub internal_blocking_pool_size: usize,

    /// Reply timeout applied when a send does not specify one.
    pub default_send_timeout: Duration,

    /// Quiet period used when the runtime shuts its event loops down.
    pub shutdown_quiet_period: Duration,

    /// Upper bound for the graceful shutdown of the event loops.
    pub shutdown_timeout: Duration,

    /// Reject shared pool acquisitions whose size differs from the live pool.
    pub strict_shared_pool_sizes: bool,

    /// Observer receiving loop, pool and event bus events.
    pub metrics: Arc<dyn Metrics>,
}

impl Default for SwitchyardConfig {
    fn default() -> Self {
        Self {
            event_loop_pool_size: 2 * num_cpus::get(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            internal_blocking_pool_size: DEFAULT_INTERNAL_BLOCKING_POOL_SIZE,
            default_send_timeout: DEFAULT_SEND_TIMEOUT,
            shutdown_quiet_period: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(5),
            strict_shared_pool_sizes: false,
            metrics: Arc::new(NoopMetrics),
        }
    }
}

impl SwitchyardConfig {
    pub fn with_event_loop_pool_size(mut self, size: usize) -> Self {
        self.event_loop_pool_size = size;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_internal_blocking_pool_size(mut self, size: usize) -> Self {
        self.internal_blocking_pool_size = size;
        self
    }

    pub fn with_default_send_timeout(mut self, timeout: Duration) -> Self {
        self.default_send_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, quiet_period: Duration, timeout: Duration) -> Self {
        self.shutdown_quiet_period = quiet_period;
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_strict_shared_pool_sizes(mut self, strict: bool) -> Self {
        self.strict_shared_pool_sizes = strict;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Check the sizes before any thread is started.
    pub fn validate(&self) -> Result<(), String> {
        if self.event_loop_pool_size == 0 {
            return Err("event_loop_pool_size must be at least 1".to_string());
        }
        if self.worker_pool_size == 0 {
            return Err("worker_pool_size must be at least 1".to_string());
        }
        if self.internal_blocking_pool_size == 0 {
            return Err("internal_blocking_pool_size must be at least 1".to_string());
        }
        Ok(())
    }
}

// --- Delivery Configuration ---

/// Per-message options, potentially overriding bus defaults.
#[derive(Clone, Debug, Default)]
pub struct DeliveryOptions {
    /// Reply timeout for this send; the bus default when `None`.
    pub send_timeout: Option<Duration>,

    /// Headers carried with the message.
    pub headers: Headers,

    /// Codec to use when the message leaves the process, by name.
    pub codec_name: Option<String>,

    /// Deliver only to handlers on this node.
    pub local_only: bool,
}

impl DeliveryOptions {
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_codec(mut self, codec_name: impl Into<String>) -> Self {
        self.codec_name = Some(codec_name.into());
        self
    }

    pub fn with_local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }
}
