//! Idle dispatch: the host-loop contract and a concrete single-threaded
//! loop.
//!
//! The crate does not own an event loop; it only requires an
//! [`IdleScheduler`] — something that runs queued callbacks on the host
//! thread between its higher-priority work. Async resumptions and event
//! subscriptions dispatch through whichever scheduler the current thread
//! has entered.
//!
//! [`IdleLoop`] is a self-contained implementation: an ordered callback
//! queue plus a [`IdleLoop::block_on`] driver, enough to host the `*_async`
//! operations without an external framework. A callback returning `true`
//! is re-armed for the next idle pass, `false` detaches it.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

use crate::queue::wait_queue::Wait;

/// An idle callback: return `true` to stay scheduled for the next idle
/// pass, `false` to be removed.
pub type IdleCallback = Box<dyn FnMut() -> bool + Send>;

/// Identifier of a scheduled idle callback, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdleId(u64);

/// The host-loop contract: schedule a callback at a priority (lower value
/// runs first), or cancel it again.
pub trait IdleScheduler: Send + Sync {
    /// Schedules `callback` to run on the host thread's next idle pass.
    fn schedule(&self, priority: i32, callback: IdleCallback) -> IdleId;

    /// Removes a scheduled callback. Returns `false` if it already ran its
    /// last pass or was never scheduled.
    fn cancel(&self, id: IdleId) -> bool;
}

thread_local! {
    static CURRENT_HOST: RefCell<Vec<Arc<dyn IdleScheduler>>> = const { RefCell::new(Vec::new()) };
}

/// Returns the idle scheduler the current thread has entered, if any.
#[must_use]
pub fn current() -> Option<Arc<dyn IdleScheduler>> {
    CURRENT_HOST.with(|stack| stack.borrow().last().map(Arc::clone))
}

/// Binds `scheduler` as the current thread's host until the guard drops.
#[must_use]
pub fn enter(scheduler: Arc<dyn IdleScheduler>) -> HostGuard {
    CURRENT_HOST.with(|stack| stack.borrow_mut().push(scheduler));
    HostGuard {
        _not_send: PhantomData,
    }
}

/// Guard returned by [`enter`]; unbinds the scheduler on drop.
pub struct HostGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        CURRENT_HOST.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl std::fmt::Debug for HostGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostGuard")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct IdleKey {
    priority: i32,
    age: u64,
}

struct IdleEntry {
    id: u64,
    callback: IdleCallback,
}

struct LoopState {
    entries: BTreeMap<IdleKey, IdleEntry>,
    ids: HashMap<u64, IdleKey>,
    next_age: u64,
    woken: bool,
}

struct LoopInner {
    state: Mutex<LoopState>,
    signal: Condvar,
    next_id: AtomicU64,
}

/// A single-threaded idle loop.
///
/// Callbacks may be scheduled from any thread; they run on whichever
/// thread drives the loop via [`IdleLoop::run_once`], [`IdleLoop::drain`],
/// or [`IdleLoop::block_on`].
#[derive(Clone)]
pub struct IdleLoop {
    inner: Arc<LoopInner>,
}

impl IdleLoop {
    /// Creates an empty loop.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopInner {
                state: Mutex::new(LoopState {
                    entries: BTreeMap::new(),
                    ids: HashMap::new(),
                    next_age: 0,
                    woken: false,
                }),
                signal: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// This loop as a shareable scheduler handle.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn IdleScheduler> {
        Arc::clone(&self.inner) as Arc<dyn IdleScheduler>
    }

    /// Binds this loop as the current thread's host scheduler.
    #[must_use]
    pub fn enter(&self) -> HostGuard {
        enter(self.handle())
    }

    /// Number of scheduled callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock_state().entries.len()
    }

    /// `true` when nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the next idle callback, waiting up to `wait` for one to be
    /// scheduled. Returns `true` if a callback ran.
    pub fn run_once(&self, wait: Wait) -> bool {
        let deadline = match wait {
            Wait::Forever => None,
            Wait::None => Some(Instant::now()),
            Wait::For(d) => Some(Instant::now() + d),
        };
        let (key, mut entry) = {
            let mut state = self.inner.lock_state();
            loop {
                if let Some((key, entry)) = state.entries.pop_first() {
                    state.ids.remove(&entry.id);
                    break (key, entry);
                }
                let parked = match deadline {
                    None => recover(self.inner.signal.wait(state)),
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return false;
                        }
                        match self.inner.signal.wait_timeout(state, d - now) {
                            Ok((guard, _)) => guard,
                            Err(poisoned) => poisoned.into_inner().0,
                        }
                    }
                };
                state = parked;
            }
        };
        let rearm = (entry.callback)();
        if rearm {
            let mut state = self.inner.lock_state();
            state.next_age += 1;
            let key = IdleKey {
                priority: key.priority,
                age: state.next_age,
            };
            state.ids.insert(entry.id, key);
            state.entries.insert(key, entry);
        }
        true
    }

    /// Runs callbacks until the loop is momentarily empty; returns how many
    /// dispatches ran.
    pub fn drain(&self) -> usize {
        let mut dispatched = 0;
        while self.run_once(Wait::None) {
            dispatched += 1;
        }
        dispatched
    }

    /// Drives `future` to completion on this thread, running idle
    /// callbacks whenever the future is pending.
    ///
    /// The loop is entered as the current host for the duration, so
    /// `*_async` operations created inside resume here.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _host = self.enter();
        let mut future = pin!(future);
        let waker = Waker::from(Arc::new(LoopWaker {
            inner: Arc::clone(&self.inner),
        }));
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
                return value;
            }
            loop {
                let dispatched = self.run_once(Wait::None);
                let mut state = self.inner.lock_state();
                if state.woken {
                    state.woken = false;
                    break;
                }
                if !dispatched && state.entries.is_empty() {
                    let parked = recover(self.inner.signal.wait(state));
                    state = parked;
                    if state.woken {
                        state.woken = false;
                        break;
                    }
                }
            }
        }
    }
}

impl Default for IdleLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdleLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleLoop").field("len", &self.len()).finish()
    }
}

impl IdleScheduler for IdleLoop {
    fn schedule(&self, priority: i32, callback: IdleCallback) -> IdleId {
        self.inner.schedule(priority, callback)
    }

    fn cancel(&self, id: IdleId) -> bool {
        self.inner.cancel(id)
    }
}

impl LoopInner {
    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl IdleScheduler for LoopInner {
    fn schedule(&self, priority: i32, callback: IdleCallback) -> IdleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.lock_state();
            state.next_age += 1;
            let key = IdleKey {
                priority,
                age: state.next_age,
            };
            state.ids.insert(id, key);
            state.entries.insert(key, IdleEntry { id, callback });
        }
        self.signal.notify_all();
        IdleId(id)
    }

    fn cancel(&self, id: IdleId) -> bool {
        let mut state = self.lock_state();
        match state.ids.remove(&id.0) {
            Some(key) => state.entries.remove(&key).is_some(),
            None => false,
        }
    }
}

struct LoopWaker {
    inner: Arc<LoopInner>,
}

impl Wake for LoopWaker {
    fn wake(self: Arc<Self>) {
        {
            let mut state = self.inner.lock_state();
            state.woken = true;
        }
        self.inner.signal.notify_all();
    }
}

fn recover<T>(result: std::sync::LockResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(poisoned) => poisoned.into_inner(),
    }
}
