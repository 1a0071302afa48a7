// Logging for Switchyard
//
// Built on the `tracing` ecosystem. The runtime itself only emits events;
// applications (and tests) choose a subscriber with one of the `init_*`
// functions below.
//
// ```rust
// use switchyard::logging;
//
// // DEBUG level, colored output, file/line info
// logging::init_development();
//
// // JSON output for log aggregation
// logging::init_production();
// ```
//
// Event loop threads, worker pool threads and the timer thread all carry
// names (`switchyard-eventloop-thread-N`, `<pool>-N`, `switchyard-timer`),
// so enabling `show_thread_info` makes it easy to see where a handler ran.

use std::sync::Once;

use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration for the logging subscriber.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

static INIT: Once = Once::new();

/// Install the global subscriber. Only the first call takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

        if let Some(filters) = &config.target_filters {
            for filter in filters.split(',') {
                if let Ok(directive) = filter.parse() {
                    env_filter = env_filter.add_directive(directive);
                }
            }
        }

        let registry = tracing_subscriber::registry().with(env_filter);

        let subscriber: Box<dyn Subscriber + Send + Sync> = match (config.json_format, config.show_time) {
            (true, _) => Box::new(
                registry.with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_thread_names(config.show_thread_info),
                ),
            ),
            (false, true) => Box::new(
                registry.with(
                    fmt::layer()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            ),
            (false, false) => Box::new(
                registry.with(
                    fmt::layer()
                        .without_time()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            ),
        };

        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Error setting global tracing subscriber: {}", err);
        }
    });
}

/// Whether a subscriber has been installed through this module.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

/// DEBUG for the runtime, TRACE for scheduling decisions, colored output.
pub fn init_development() {
    init(LogConfig {
        level: Level::DEBUG,
        json_format: false,
        show_file_line: true,
        show_thread_info: true,
        show_time: true,
        target_filters: Some("switchyard=debug,switchyard::event_loop=trace".to_string()),
    });
}

/// INFO level, JSON lines, no file/line information.
pub fn init_production() {
    init(LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        show_time: true,
        target_filters: None,
    });
}

/// Warnings and errors only, to keep test output readable.
///
/// ```rust
/// #[test]
/// fn my_test() {
///     switchyard::logging::init_test();
/// }
/// ```
pub fn init_test() {
    init(LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
    });
}

/// Span around work running on a context.
///
/// ```rust
/// let span = switchyard::context_span!(7u64, "worker");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! context_span {
    ($context_id:expr, $affinity:expr) => {
        tracing::debug_span!("context", id = $context_id, affinity = $affinity)
    };
    ($context_id:expr, $affinity:expr, $($fields:tt)*) => {
        tracing::debug_span!("context", id = $context_id, affinity = $affinity, $($fields)*)
    };
}

/// Log lifecycle events of loops, pools, the bus and the runtime.
///
/// ```rust
/// switchyard::log_lifecycle!("worker_pool", "reports", "closed");
/// switchyard::log_lifecycle!("event_loop", "loop-1", "shutting_down", quiet_period_ms = 100);
/// ```
#[macro_export]
macro_rules! log_lifecycle {
    ($component:expr, $name:expr, $event:expr) => {
        tracing::info!(component = $component, name = $name, event = $event);
    };
    ($component:expr, $name:expr, $event:expr, $($fields:tt)*) => {
        tracing::info!(component = $component, name = $name, event = $event, $($fields)*);
    };
}

/// Log event bus routing decisions.
///
/// ```rust
/// switchyard::log_bus!("orders", "no_handlers");
/// switchyard::log_bus!("orders", "routed", handlers = 3);
/// ```
#[macro_export]
macro_rules! log_bus {
    ($address:expr, $event:expr) => {
        tracing::debug!(address = $address, event = $event);
    };
    ($address:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(address = $address, event = $event, $($fields)*);
    };
}

/// Log error events.
///
/// ```rust
/// let error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
/// switchyard::log_error!(error, component = "cluster");
/// ```
#[macro_export]
macro_rules! log_error {
    ($error:expr) => {
        tracing::error!(error = %$error);
    };
    ($error:expr, $($fields:tt)*) => {
        tracing::error!(error = %$error, $($fields)*);
    };
}

/// Log scheduling events.
///
/// ```rust
/// switchyard::log_scheduler!("event_loop_group", "worker_added");
/// switchyard::log_scheduler!("worker_pool", "task_queued", waiting = 10);
/// ```
#[macro_export]
macro_rules! log_scheduler {
    ($scheduler:expr, $event:expr) => {
        tracing::debug!(scheduler = $scheduler, event = $event);
    };
    ($scheduler:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(scheduler = $scheduler, event = $event, $($fields)*);
    };
}
