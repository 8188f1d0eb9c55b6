//! Worker-thread accounting shared by every component that spawns against
//! queue demand.
//!
//! [`ThreadState`] is embedded by value in each owning queue and keeps the
//! spawn policy honest: idle workers count as already committed to the
//! queue, so a burst of enqueues racing a wake-up never oversubscribes.
//! The state only does the counting; the owner starts the actual threads
//! with the reservations handed out here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::queue::wait_queue::Wait;

/// Workers retire after this long idle unless configured otherwise.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(10);

/// Worker-thread policy for a task queue.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Prefix for worker thread names (`{name}-{n}`).
    pub name: String,
    /// Maximum workers; `-1` means unlimited, `0` means never spawn (the
    /// owner is driven externally via `process`).
    pub max_threads: i32,
    /// How long an idle worker waits for work before retiring.
    /// `Wait::Forever` means workers never self-retire; `Wait::None` means
    /// they retire as soon as the queue is empty.
    pub max_idle: Wait,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: "taskloom".to_string(),
            max_threads: -1,
            max_idle: Wait::For(DEFAULT_MAX_IDLE),
        }
    }
}

impl ThreadConfig {
    /// A config that never spawns workers; the queue is driven by explicit
    /// `process` calls.
    #[must_use]
    pub fn external_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_threads: 0,
            max_idle: Wait::None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    num: usize,
    idle: usize,
}

/// Per-queue worker accounting.
pub(crate) struct ThreadState {
    name: String,
    max_threads: AtomicI32,
    max_idle: Wait,
    counters: parking_lot::Mutex<Counters>,
    managed: parking_lot::Mutex<HashSet<ThreadId>>,
    next_worker: AtomicU64,
}

impl ThreadState {
    pub(crate) fn new(config: ThreadConfig) -> Self {
        Self {
            name: config.name,
            max_threads: AtomicI32::new(config.max_threads),
            max_idle: config.max_idle,
            counters: parking_lot::Mutex::new(Counters::default()),
            managed: parking_lot::Mutex::new(HashSet::new()),
            next_worker: AtomicU64::new(0),
        }
    }

    /// Reserves worker slots against `demand` dispatchable entries.
    ///
    /// `max_new < 0` means "as many as useful". Returns how many threads
    /// the owner must now start; their `num`/`idle` counts are already
    /// committed, so a failed start requires [`Self::unreserve`].
    pub(crate) fn reserve(&self, max_new: i64, demand: usize) -> usize {
        let want = if max_new < 0 {
            demand
        } else {
            (max_new as usize).min(demand)
        };
        if want == 0 {
            return 0;
        }
        let capacity = match self.max_threads.load(Ordering::Acquire) {
            m if m < 0 => usize::MAX,
            m => m as usize,
        };
        let mut counters = self.counters.lock();
        let headroom = capacity.saturating_sub(counters.num);
        let new = want.min(headroom).saturating_sub(counters.idle);
        if new == 0 {
            return 0;
        }
        counters.num += new;
        counters.idle += new;
        new
    }

    /// Rolls back reservations whose threads failed to start.
    pub(crate) fn unreserve(&self, count: usize) {
        let mut counters = self.counters.lock();
        counters.num = counters.num.saturating_sub(count);
        counters.idle = counters.idle.saturating_sub(count);
    }

    /// Raises the thread cap to `n` if the current cap is positive and
    /// smaller. An unlimited (or zero) cap is left alone.
    pub(crate) fn increase_max_threads(&self, n: i32) {
        let mut current = self.max_threads.load(Ordering::Acquire);
        while current > 0 && current < n {
            match self.max_threads.compare_exchange_weak(
                current,
                n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Runs a dispatched callback, accounting the current thread as busy
    /// when it is one of ours. External callers driving `process`
    /// themselves run without accounting.
    pub(crate) fn run_task<R>(&self, f: impl FnOnce() -> R) -> R {
        let managed = self.is_managed();
        if managed {
            self.counters.lock().idle -= 1;
        }
        let out = f();
        if managed {
            self.counters.lock().idle += 1;
        }
        out
    }

    pub(crate) fn register_current(&self) {
        self.managed.lock().insert(thread::current().id());
    }

    /// Worker exit, gated on a demand re-check.
    ///
    /// `reserve` counts idle workers as committed, so a worker that timed
    /// out must not disappear while work it was credited for sits queued:
    /// with `pending_demand > 0` the worker stays for another round.
    /// Returns `true` when the thread has been dropped from both counters
    /// and the managed set; any `reserve` running after that sees the
    /// updated counts and spawns a replacement.
    pub(crate) fn try_retire_current(&self, pending_demand: usize) -> bool {
        {
            let mut counters = self.counters.lock();
            if pending_demand > 0 {
                return false;
            }
            counters.num = counters.num.saturating_sub(1);
            counters.idle = counters.idle.saturating_sub(1);
        }
        self.managed.lock().remove(&thread::current().id());
        true
    }

    fn is_managed(&self) -> bool {
        self.managed.lock().contains(&thread::current().id())
    }

    pub(crate) fn idle_wait(&self) -> Wait {
        self.max_idle
    }

    pub(crate) fn next_worker_name(&self) -> String {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.name)
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.counters.lock().num
    }

    pub(crate) fn idle_threads(&self) -> usize {
        self.counters.lock().idle
    }

    pub(crate) fn max_threads(&self) -> i32 {
        self.max_threads.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counters = self.counters.lock();
        f.debug_struct("ThreadState")
            .field("name", &self.name)
            .field("max_threads", &self.max_threads())
            .field("num", &counters.num)
            .field("idle", &counters.idle)
            .finish()
    }
}
