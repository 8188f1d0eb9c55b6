//! Lazy single-instance initialization with a contention-safe build.
//!
//! The cell's build gate is a `Semaphore(1)`, so waiting for a slow factory
//! is priority-ordered and cancellable like any other acquisition in the
//! crate. At most one factory invocation ever succeeds; a factory failure
//! leaves the cell unset so a later caller can retry. Once set, reads are
//! lock-free.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::queue::task_queue::{default_queue, ExecuteBackground, TaskQueue};
use crate::queue::workers::ThreadConfig;
use crate::sync::semaphore::{LockFuture, Semaphore};

struct LazyInner<T> {
    value: OnceLock<T>,
    gate: Semaphore,
    factory: Box<dyn Fn() -> Result<T> + Send + Sync>,
    queue: TaskQueue,
}

/// A lazily built single instance.
///
/// Cloning yields another handle to the same cell.
///
/// # Example
///
/// ```no_run
/// use taskloom::sync::Lazy;
///
/// let config = Lazy::new(|| Ok(std::collections::HashMap::<String, String>::new()));
/// let map = config.get(0, None).unwrap();
/// assert!(map.is_empty());
/// ```
#[derive(Clone)]
pub struct Lazy<T: Send + Sync + 'static> {
    inner: Arc<LazyInner<T>>,
}

impl<T: Send + Sync + 'static> Lazy<T> {
    /// Creates a cell that will build its value with `factory` on first
    /// touch.
    #[must_use]
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::with_queue(factory, default_queue())
    }

    /// Creates a cell whose background builds run on `queue`.
    #[must_use]
    pub fn with_queue<F>(factory: F, queue: TaskQueue) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(LazyInner {
                value: OnceLock::new(),
                gate: Semaphore::with_config(
                    1,
                    ThreadConfig {
                        name: "lazy-gate".to_string(),
                        ..ThreadConfig::default()
                    },
                ),
                factory: Box::new(factory),
                queue,
            }),
        }
    }

    /// The value, if it has already been built.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.inner.value.get()
    }

    /// Returns the value, building it on first touch.
    ///
    /// Concurrent callers contend on the build gate; exactly one runs the
    /// factory and all observe the same instance. A factory failure is
    /// propagated and leaves the cell unset for retry.
    pub fn get(&self, priority: i32, cancel: Option<&CancelToken>) -> Result<&T> {
        get_blocking(&self.inner, priority, cancel)?;
        Ok(self
            .inner
            .value
            .get()
            .expect("value present after successful build"))
    }

    /// Cooperative variant of [`Lazy::get`]: suspends while another caller
    /// holds the build gate.
    pub fn get_async(&self, priority: i32, cancel: Option<&CancelToken>) -> LazyGet<'_, T> {
        LazyGet {
            lazy: self,
            priority,
            cancel: cancel.cloned(),
            state: GetState::Init,
        }
    }

    /// Builds the value on a worker of the cell's task queue; the returned
    /// future suspends until the value is available.
    pub fn get_background(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
    ) -> LazyGetBackground<'_, T> {
        let inner = Arc::clone(&self.inner);
        let gate_cancel = cancel.cloned();
        let job = self.inner.queue.execute_background(priority, cancel, move || {
            get_blocking(&inner, priority, gate_cancel.as_ref())
        });
        LazyGetBackground { lazy: self, job }
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lazy")
            .field("initialized", &self.peek().is_some())
            .finish()
    }
}

/// Fast path, then gate, then double-checked build.
fn get_blocking<T: Send + Sync + 'static>(
    inner: &Arc<LazyInner<T>>,
    priority: i32,
    cancel: Option<&CancelToken>,
) -> Result<()> {
    if inner.value.get().is_some() {
        return Ok(());
    }
    inner.gate.lock(priority, cancel)?;
    let result = build_locked(inner);
    inner.gate.unlock();
    result
}

/// Caller holds the gate.
fn build_locked<T: Send + Sync + 'static>(inner: &LazyInner<T>) -> Result<()> {
    if inner.value.get().is_some() {
        return Ok(());
    }
    match (inner.factory)() {
        Ok(value) => {
            let _ = inner.value.set(value);
            Ok(())
        }
        Err(err) => Err(Error::factory_failed(err)),
    }
}

enum GetState {
    Init,
    Gating(LockFuture),
    Done,
}

/// Future returned by [`Lazy::get_async`].
#[must_use = "futures do nothing unless polled"]
pub struct LazyGet<'a, T: Send + Sync + 'static> {
    lazy: &'a Lazy<T>,
    priority: i32,
    cancel: Option<CancelToken>,
    state: GetState,
}

impl<'a, T: Send + Sync + 'static> Future for LazyGet<'a, T> {
    type Output = Result<&'a T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let lazy = self.lazy;
        loop {
            match &mut self.state {
                GetState::Init => {
                    if let Some(value) = lazy.inner.value.get() {
                        self.state = GetState::Done;
                        return Poll::Ready(Ok(value));
                    }
                    let lock = lazy.inner.gate.lock_async(self.priority, self.cancel.as_ref());
                    self.state = GetState::Gating(lock);
                }
                GetState::Gating(lock) => {
                    let granted = ready!(Pin::new(lock).poll(cx));
                    self.state = GetState::Done;
                    return match granted {
                        Ok(()) => {
                            let built = build_locked(&lazy.inner);
                            lazy.inner.gate.unlock();
                            match built {
                                Ok(()) => Poll::Ready(Ok(lazy
                                    .inner
                                    .value
                                    .get()
                                    .expect("value present after successful build"))),
                                Err(err) => Poll::Ready(Err(err)),
                            }
                        }
                        Err(err) => Poll::Ready(Err(err)),
                    };
                }
                GetState::Done => return Poll::Pending,
            }
        }
    }
}

/// Future returned by [`Lazy::get_background`].
#[must_use = "futures do nothing unless polled"]
pub struct LazyGetBackground<'a, T: Send + Sync + 'static> {
    lazy: &'a Lazy<T>,
    job: ExecuteBackground<()>,
}

impl<'a, T: Send + Sync + 'static> Future for LazyGetBackground<'a, T> {
    type Output = Result<&'a T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let lazy = self.lazy;
        match ready!(Pin::new(&mut self.job).poll(cx)) {
            Ok(()) => Poll::Ready(Ok(lazy
                .inner
                .value
                .get()
                .expect("value present after successful build"))),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::IdleLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn factory_runs_once_under_contention() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let lazy = Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            Ok(41)
        });

        let mut callers = Vec::new();
        for _ in 0..8 {
            let lazy = lazy.clone();
            callers.push(thread::spawn(move || *lazy.get(0, None).unwrap()));
        }
        for caller in callers {
            assert_eq!(caller.join().unwrap(), 41);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_leaves_the_cell_unset_for_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let lazy = Lazy::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::invalid_state("first build fails"))
            } else {
                Ok("second time lucky")
            }
        });

        let err = lazy.get(0, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FactoryFailed);
        assert!(lazy.peek().is_none());

        assert_eq!(*lazy.get(0, None).unwrap(), "second time lucky");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn get_async_observes_the_same_instance() {
        let lazy = Lazy::new(|| Ok(vec![1, 2, 3]));
        let first = lazy.get(0, None).unwrap() as *const Vec<i32>;
        let again = IdleLoop::new().block_on(lazy.get_async(0, None)).unwrap();
        assert_eq!(first, again as *const Vec<i32>);
    }

    #[test]
    fn get_background_builds_on_a_worker() {
        let host = thread::current().id();
        let lazy = Lazy::new(move || {
            assert_ne!(thread::current().id(), host);
            Ok(7)
        });
        let value = IdleLoop::new()
            .block_on(lazy.get_background(0, None))
            .unwrap();
        assert_eq!(*value, 7);
        assert_eq!(lazy.peek(), Some(&7));
    }
}
