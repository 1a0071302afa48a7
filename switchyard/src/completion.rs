use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

type Listener<T> = Box<dyn FnOnce(T) + Send>;

/// A write-once value with listeners.
///
/// Used for termination handles, registration acknowledgments and
/// runtime close. The first `complete` wins; listeners added afterwards run
/// immediately on the caller's thread. Waiting is available both blocking
/// (`wait_timeout`) and async (`wait`).
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

struct PromiseInner<T> {
    state: Mutex<PromiseState<T>>,
    cond: Condvar,
    notify: Notify,
}

struct PromiseState<T> {
    value: Option<T>,
    listeners: Vec<Listener<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                state: Mutex::new(PromiseState { value: None, listeners: Vec::new() }),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// A promise that is already complete.
    pub fn completed(value: T) -> Self {
        let promise = Self::new();
        promise.complete(value);
        promise
    }

    /// Complete the promise. Returns `false` if it was already complete.
    pub fn complete(&self, value: T) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            std::mem::take(&mut state.listeners)
        };
        self.inner.cond.notify_all();
        self.inner.notify.notify_waiters();
        for listener in listeners {
            listener(value.clone());
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().value.is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.inner.state.lock().value.clone()
    }

    /// Run `listener` with the value once the promise completes.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.value.clone() {
            Some(value) => {
                drop(state);
                listener(value);
            }
            None => state.listeners.push(Box::new(listener)),
        }
    }

    /// Block the current thread until completion or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.value.is_none() {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.value.clone()
    }

    pub async fn wait(&self) -> T {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Promise")
            .field("complete", &state.value.is_some())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}
