use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::EventLoop;
use crate::completion::Promise;
use crate::context::Context;
use crate::error::GroupError;
use crate::pool::WorkerPool;

/// A connection-like object that binds to one event loop for its lifetime.
pub trait Channel: Send + 'static {
    /// Identifier used in logs.
    fn id(&self) -> String;

    /// Called on the chosen event loop once the channel is bound to `context`.
    fn registered(&mut self, context: &Context);
}

struct Holder {
    event_loop: EventLoop,
    count: usize,
}

struct Members {
    holders: Vec<Holder>,
    pos: usize,
}

struct GroupInner {
    members: Mutex<Members>,
    blocking_pool: Option<WorkerPool>,
    shutting_down: AtomicBool,
    // Fires as soon as shutdown starts, forced or graceful.
    shutdown_latch: Promise<()>,
    // Fires once every member loop has terminated.
    termination: Promise<()>,
    remaining: AtomicUsize,
}

/// Round-robin dispatcher over event loops that may be shared with other
/// groups.
///
/// Adding a loop that is already a member increments its count instead of
/// adding a slot; removing decrements it and drops the slot at zero. `next`
/// walks the distinct loops in insertion order.
#[derive(Clone)]
pub struct EventLoopGroup {
    inner: Arc<GroupInner>,
}

impl EventLoopGroup {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A group whose contexts offload blocking work to `pool`.
    pub fn with_blocking_pool(pool: WorkerPool) -> Self {
        Self::build(Some(pool))
    }

    fn build(blocking_pool: Option<WorkerPool>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                members: Mutex::new(Members { holders: Vec::new(), pos: 0 }),
                blocking_pool,
                shutting_down: AtomicBool::new(false),
                shutdown_latch: Promise::new(),
                termination: Promise::new(),
                remaining: AtomicUsize::new(0),
            }),
        }
    }

    pub fn add_worker(&self, event_loop: EventLoop) {
        let mut members = self.inner.members.lock();
        match members.holders.iter_mut().find(|h| h.event_loop == event_loop) {
            Some(holder) => holder.count += 1,
            None => members.holders.push(Holder { event_loop: event_loop.clone(), count: 1 }),
        }
        crate::log_scheduler!("event_loop_group", "worker_added", event_loop = event_loop.name());
    }

    pub fn remove_worker(&self, event_loop: &EventLoop) -> Result<(), GroupError> {
        let mut members = self.inner.members.lock();
        let index = members
            .holders
            .iter()
            .position(|h| &h.event_loop == event_loop)
            .ok_or_else(|| GroupError::NotFound(event_loop.name().to_string()))?;

        members.holders[index].count -= 1;
        if members.holders[index].count == 0 {
            members.holders.remove(index);
            // Keep the cursor on the loop that would have come next.
            if index < members.pos {
                members.pos -= 1;
            }
            if members.pos >= members.holders.len() {
                members.pos = 0;
            }
        }
        crate::log_scheduler!("event_loop_group", "worker_removed", event_loop = event_loop.name());
        Ok(())
    }

    /// The next loop in round-robin order.
    pub fn next(&self) -> Result<EventLoop, GroupError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(GroupError::ShutDown);
        }
        let mut members = self.inner.members.lock();
        if members.holders.is_empty() {
            return Err(GroupError::EmptyGroup);
        }
        if members.pos >= members.holders.len() {
            members.pos = 0;
        }
        let event_loop = members.holders[members.pos].event_loop.clone();
        members.pos = (members.pos + 1) % members.holders.len();
        Ok(event_loop)
    }

    /// Number of distinct member loops.
    pub fn worker_count(&self) -> usize {
        self.inner.members.lock().holders.len()
    }

    /// How many times `event_loop` has been added and not yet removed.
    pub fn reuse_count(&self, event_loop: &EventLoop) -> usize {
        self.inner
            .members
            .lock()
            .holders
            .iter()
            .find(|h| &h.event_loop == event_loop)
            .map_or(0, |h| h.count)
    }

    /// Snapshot of the member loops in insertion order.
    pub fn loops(&self) -> Vec<EventLoop> {
        self.inner.members.lock().holders.iter().map(|h| h.event_loop.clone()).collect()
    }

    /// Bind a fresh context to the next loop.
    pub fn register_context(&self) -> Result<Context, GroupError> {
        let event_loop = self.next()?;
        Ok(Context::on_event_loop(event_loop, self.inner.blocking_pool.clone()))
    }

    /// Bind `channel` to the next loop and notify it there.
    pub fn register(&self, channel: Box<dyn Channel>) -> Result<Context, GroupError> {
        let context = self.register_context()?;
        let id = channel.id();
        let bound = context.clone();
        let mut channel = channel;
        context
            .run_on_context(move || channel.registered(&bound))
            .map_err(|_| GroupError::ShutDown)?;
        crate::log_scheduler!(
            "event_loop_group",
            "channel_registered",
            channel = id.as_str(),
            event_loop = context.event_loop().map(|l| l.name()).unwrap_or_default()
        );
        Ok(context)
    }

    /// Force every member loop to stop. The group counts as terminated as
    /// soon as this returns; loop threads finish their current task on
    /// their own.
    ///
    /// Also escalates a graceful shutdown that is still in progress.
    pub fn shutdown(&self) -> Promise<()> {
        if self.begin_shutdown() {
            crate::log_lifecycle!("event_loop_group", "group", "shutting_down", forced = true);
        }
        for event_loop in self.loops() {
            event_loop.shutdown();
        }
        self.inner.termination.complete(());
        self.inner.termination.clone()
    }

    /// Shut every member loop down gracefully.
    ///
    /// The first call starts the shutdown; later calls, and calls after
    /// `shutdown`, return the same termination promise.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Promise<()> {
        if self.begin_shutdown() {
            crate::log_lifecycle!(
                "event_loop_group",
                "group",
                "shutting_down",
                loops = self.worker_count()
            );
            for event_loop in self.loops() {
                event_loop.shutdown_gracefully(quiet_period, timeout);
            }
        }
        self.inner.termination.clone()
    }

    /// Flip the shutdown flag and arm the aggregate termination. Returns
    /// `false` if shutdown had already begun.
    fn begin_shutdown(&self) -> bool {
        if self
            .inner
            .shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inner.shutdown_latch.complete(());

        let loops = self.loops();
        if loops.is_empty() {
            self.inner.termination.complete(());
            return true;
        }
        self.inner.remaining.store(loops.len(), Ordering::Release);
        for event_loop in loops {
            let inner = Arc::clone(&self.inner);
            event_loop.termination().on_complete(move |_| {
                if inner.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    inner.termination.complete(());
                }
            });
        }
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown_latch.is_complete()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.termination.is_complete()
    }

    /// Block until every loop has terminated or `timeout` elapses.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.termination.wait_timeout(timeout).is_some()
    }

    pub fn termination(&self) -> Promise<()> {
        self.inner.termination.clone()
    }
}

impl Default for EventLoopGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("workers", &self.worker_count())
            .field("shutting_down", &self.is_shutting_down())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_api::metrics::NoopMetrics;

    fn spawn(name: &str) -> EventLoop {
        EventLoop::spawn(name, &NoopMetrics).unwrap()
    }

    #[test]
    fn test_round_robin_over_distinct_loops() {
        let group = EventLoopGroup::new();
        let a = spawn("group-rr-a");
        let b = spawn("group-rr-b");
        group.add_worker(a.clone());
        group.add_worker(b.clone());
        group.add_worker(a.clone());

        assert_eq!(group.worker_count(), 2);
        assert_eq!(group.reuse_count(&a), 2);
        assert_eq!(group.next().unwrap(), a);
        assert_eq!(group.next().unwrap(), b);
        assert_eq!(group.next().unwrap(), a);

        group.shutdown();
        assert!(group.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_remove_keeps_cursor_valid() {
        let group = EventLoopGroup::new();
        let a = spawn("group-rm-a");
        let b = spawn("group-rm-b");
        let c = spawn("group-rm-c");
        for l in [&a, &b, &c] {
            group.add_worker(l.clone());
        }
        assert_eq!(group.next().unwrap(), a);
        assert_eq!(group.next().unwrap(), b);
        group.remove_worker(&a).unwrap();
        assert_eq!(group.next().unwrap(), c);
        assert_eq!(group.next().unwrap(), b);

        let err = group.remove_worker(&a).unwrap_err();
        assert_eq!(err, GroupError::NotFound("group-rm-a".to_string()));

        group.shutdown();
        for l in [&a, &b, &c] {
            l.shutdown();
        }
    }

    #[test]
    fn test_empty_group() {
        let group = EventLoopGroup::new();
        assert_eq!(group.next().unwrap_err(), GroupError::EmptyGroup);
        let termination = group.shutdown_gracefully(Duration::ZERO, Duration::from_secs(1));
        assert!(termination.is_complete());
        assert!(group.is_terminated());
        assert_eq!(group.next().unwrap_err(), GroupError::ShutDown);
    }
}
