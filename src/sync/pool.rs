//! Resource pool: recycles expensive objects with optional capacity and
//! idle reaping.
//!
//! Released resources sit in a LIFO free-list (head = most recently used);
//! a reaper walks the tail and destroys anything idle past `max_idle`. A
//! capped pool admits acquisitions through a [`Semaphore`] sized to the
//! cap, so waiting is priority-ordered and cancellable like every other
//! operation in the crate; an uncapped pool creates on demand and relies
//! on the reaper alone.
//!
//! Lock discipline: the free-list and the active set have separate locks
//! and are never held together; the reaper takes only the free-list.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::queue::task_queue::{default_queue, ExecuteBackground, TaskQueue};
use crate::queue::workers::{ThreadConfig, DEFAULT_MAX_IDLE};
use crate::sync::claim::ResourceClaim;
use crate::sync::semaphore::{LockFuture, Semaphore};
use crate::time::{wall_clock, TimeSource};

/// Error returned by [`ResourcePool::try_acquire`].
#[derive(Debug, thiserror::Error)]
pub enum TryAcquireError {
    /// The pool is at capacity and no resource is idle.
    #[error("no resource immediately available")]
    WouldBlock,
    /// The pool has been shut down.
    #[error("pool shut down")]
    Shutdown,
    /// The factory failed while building a fresh resource.
    #[error("resource factory failed")]
    Factory(#[source] Error),
}

/// Construction parameters for a [`ResourcePool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix for the reaper and gate thread names.
    pub name: String,
    /// Resource cap; `0` means unlimited.
    pub max_resources: usize,
    /// Idle time after which a released resource is destroyed.
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            max_resources: 0,
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

/// The factory invoked under the pool's admission to build a resource.
pub type PoolFactory<R> =
    Box<dyn Fn(i32, Option<&CancelToken>) -> Result<R> + Send + Sync>;

struct IdleEntry<R> {
    resource: Arc<R>,
    last_used: crate::time::Ticks,
}

struct FreeList<R> {
    entries: VecDeque<IdleEntry<R>>,
    reaper_running: bool,
    closed: bool,
}

pub(crate) struct PoolCore<R: Send + Sync + 'static> {
    name: String,
    factory: PoolFactory<R>,
    gate: Option<Semaphore>,
    queue: TaskQueue,
    free: parking_lot::Mutex<FreeList<R>>,
    free_signal: parking_lot::Condvar,
    active: parking_lot::Mutex<HashSet<usize>>,
    total: AtomicUsize,
    max_idle: Duration,
    clock: Arc<dyn TimeSource>,
}

impl<R: Send + Sync + 'static> PoolCore<R> {
    pub(crate) fn clock(&self) -> &Arc<dyn TimeSource> {
        &self.clock
    }

    fn is_closed(&self) -> bool {
        self.free.lock().closed
    }

    /// Full acquisition: admission gate, then free-list, then factory.
    fn acquire_resource(
        core: &Arc<Self>,
        priority: i32,
        cancel: Option<&CancelToken>,
    ) -> Result<Arc<R>> {
        if core.is_closed() {
            return Err(Error::shut_down());
        }
        if let Some(gate) = &core.gate {
            gate.lock(priority, cancel)?;
        }
        match core.checkout(priority, cancel) {
            Ok(resource) => Ok(resource),
            Err(err) => {
                if let Some(gate) = &core.gate {
                    gate.unlock();
                }
                Err(err)
            }
        }
    }

    /// Admission already granted: recycle from the free-list head or build
    /// a fresh resource.
    fn checkout(&self, priority: i32, cancel: Option<&CancelToken>) -> Result<Arc<R>> {
        let recycled = self.free.lock().entries.pop_front();
        if let Some(entry) = recycled {
            let resource = entry.resource;
            self.active
                .lock()
                .insert(Arc::as_ptr(&resource) as usize);
            return Ok(resource);
        }
        match (self.factory)(priority, cancel) {
            Ok(value) => {
                let resource = Arc::new(value);
                self.total.fetch_add(1, Ordering::SeqCst);
                self.active
                    .lock()
                    .insert(Arc::as_ptr(&resource) as usize);
                trace!("pool created a new resource");
                Ok(resource)
            }
            Err(err) => Err(Error::factory_failed(err)),
        }
    }

    /// Moves a resource back onto the free-list head and re-opens the
    /// admission gate.
    pub(crate) fn release_resource(core: &Arc<Self>, resource: Arc<R>) {
        let key = Arc::as_ptr(&resource) as usize;
        if !core.active.lock().remove(&key) {
            error!("release of a resource this pool does not own");
            return;
        }
        let now = core.clock.now();
        let mut returned = Some(resource);
        {
            let mut free = core.free.lock();
            if !free.closed {
                if let Some(resource) = returned.take() {
                    free.entries.push_front(IdleEntry {
                        resource,
                        last_used: now,
                    });
                    Self::ensure_reaper(core, &mut free);
                }
            }
        }
        if let Some(resource) = returned {
            // Closed while the caller still held it: destroy instead.
            core.total.fetch_sub(1, Ordering::SeqCst);
            drop(resource);
        }
        core.free_signal.notify_all();
        if let Some(gate) = &core.gate {
            gate.unlock();
        }
    }

    fn ensure_reaper(core: &Arc<Self>, free: &mut FreeList<R>) {
        if free.reaper_running {
            return;
        }
        free.reaper_running = true;
        let reaper_core = Arc::clone(core);
        let spawned = thread::Builder::new()
            .name(format!("{}-reaper", core.name))
            .spawn(move || reaper_loop(&reaper_core));
        if let Err(err) = spawned {
            error!(%err, "failed to start pool reaper");
            free.reaper_running = false;
        }
    }

    /// Destroys every free-list tail entry idle past `max_idle`; resources
    /// are dropped outside the lock.
    fn reap_expired(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut free = self.free.lock();
            let now = self.clock.now();
            while let Some(oldest) = free.entries.back() {
                if now.saturating_since(oldest.last_used) >= self.max_idle {
                    if let Some(entry) = free.entries.pop_back() {
                        expired.push(entry.resource);
                    }
                } else {
                    break;
                }
            }
        }
        if expired.is_empty() {
            return 0;
        }
        let count = expired.len();
        self.total.fetch_sub(count, Ordering::SeqCst);
        debug!(count, "reaped idle resources");
        drop(expired);
        count
    }

    fn close(&self) {
        let drained = {
            let mut free = self.free.lock();
            free.closed = true;
            std::mem::take(&mut free.entries)
        };
        self.total.fetch_sub(drained.len(), Ordering::SeqCst);
        drop(drained);
        self.free_signal.notify_all();
        if let Some(gate) = &self.gate {
            gate.shutdown();
        }
    }
}

fn reaper_loop<R: Send + Sync + 'static>(core: &Arc<PoolCore<R>>) {
    debug!("pool reaper started");
    loop {
        core.reap_expired();
        let mut free = core.free.lock();
        if free.closed || free.entries.is_empty() {
            free.reaper_running = false;
            break;
        }
        let last_used = match free.entries.back() {
            Some(oldest) => oldest.last_used,
            None => {
                free.reaper_running = false;
                break;
            }
        };
        let deadline = last_used.saturating_add(core.max_idle);
        let now = core.clock.now();
        if now < deadline {
            let timeout = deadline.saturating_since(now);
            let _ = core.free_signal.wait_for(&mut free, timeout);
        }
    }
    debug!("pool reaper exited");
}

/// A pool of reusable resources with optional cap and idle reaping.
///
/// Acquired resources are handed out as `Arc<R>` and must come back via
/// [`ResourcePool::release`] (or ride a [`ResourceClaim`] that releases on
/// drop). Dropping the pool destroys idle resources and closes the gate;
/// resources still checked out are destroyed on their release.
pub struct ResourcePool<R: Send + Sync + 'static> {
    core: Arc<PoolCore<R>>,
}

impl<R: Send + Sync + 'static> ResourcePool<R> {
    /// Creates a pool using the process-wide default task queue for
    /// background execution.
    #[must_use]
    pub fn new<F>(factory: F, config: PoolConfig) -> Self
    where
        F: Fn(i32, Option<&CancelToken>) -> Result<R> + Send + Sync + 'static,
    {
        Self::with_queue(factory, config, default_queue())
    }

    /// Creates a pool with an explicit task queue for background
    /// execution.
    #[must_use]
    pub fn with_queue<F>(factory: F, config: PoolConfig, queue: TaskQueue) -> Self
    where
        F: Fn(i32, Option<&CancelToken>) -> Result<R> + Send + Sync + 'static,
    {
        Self::build(Box::new(factory), config, queue, wall_clock())
    }

    pub(crate) fn build(
        factory: PoolFactory<R>,
        config: PoolConfig,
        queue: TaskQueue,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let gate = (config.max_resources > 0).then(|| {
            Semaphore::with_config(
                config.max_resources,
                ThreadConfig {
                    name: format!("{}-gate", config.name),
                    ..ThreadConfig::default()
                },
            )
        });
        Self {
            core: Arc::new(PoolCore {
                name: config.name,
                factory,
                gate,
                queue,
                free: parking_lot::Mutex::new(FreeList {
                    entries: VecDeque::new(),
                    reaper_running: false,
                    closed: false,
                }),
                free_signal: parking_lot::Condvar::new(),
                active: parking_lot::Mutex::new(HashSet::new()),
                total: AtomicUsize::new(0),
                max_idle: config.max_idle,
                clock,
            }),
        }
    }

    /// Total resources currently alive (idle + active).
    #[must_use]
    pub fn num_resources(&self) -> usize {
        self.core.total.load(Ordering::SeqCst)
    }

    /// Resources sitting idle on the free-list.
    #[must_use]
    pub fn num_idle(&self) -> usize {
        self.core.free.lock().entries.len()
    }

    /// Resources currently checked out.
    #[must_use]
    pub fn num_active(&self) -> usize {
        self.core.active.lock().len()
    }

    /// Acquires a resource, blocking on the admission gate if capped.
    ///
    /// Recycles the most recently used idle resource when one exists;
    /// otherwise invokes the factory. A factory failure releases the
    /// admission and surfaces as `FactoryFailed`.
    pub fn acquire(&self, priority: i32, cancel: Option<&CancelToken>) -> Result<Arc<R>> {
        PoolCore::acquire_resource(&self.core, priority, cancel)
    }

    /// Non-blocking acquire: fails with `WouldBlock` instead of waiting on
    /// the admission gate.
    pub fn try_acquire(&self) -> std::result::Result<Arc<R>, TryAcquireError> {
        if self.core.is_closed() {
            return Err(TryAcquireError::Shutdown);
        }
        if let Some(gate) = &self.core.gate {
            if gate.try_lock().is_err() {
                return Err(TryAcquireError::WouldBlock);
            }
        }
        match self.core.checkout(0, None) {
            Ok(resource) => Ok(resource),
            Err(err) => {
                if let Some(gate) = &self.core.gate {
                    gate.unlock();
                }
                Err(TryAcquireError::Factory(err))
            }
        }
    }

    /// Cooperative acquire: suspends on the admission gate when capped.
    pub fn acquire_async(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
    ) -> PoolAcquireFuture<R> {
        PoolAcquireFuture {
            core: Arc::clone(&self.core),
            priority,
            cancel: cancel.cloned(),
            state: AcquireState::Init,
        }
    }

    /// Returns a resource to the pool.
    ///
    /// Releasing a resource the pool did not hand out is a violation:
    /// logged, then ignored.
    pub fn release(&self, resource: Arc<R>) {
        PoolCore::release_resource(&self.core, resource);
    }

    /// Acquires, calls `f` with the resource, and releases unconditionally.
    pub fn execute<T, F>(&self, priority: i32, cancel: Option<&CancelToken>, f: F) -> Result<T>
    where
        F: FnOnce(&R) -> Result<T>,
    {
        let resource = self.acquire(priority, cancel)?;
        let result = catch_unwind(AssertUnwindSafe(|| f(&resource)));
        self.release(resource);
        match result {
            Ok(result) => result,
            Err(panic) => Err(Error::callback_panicked(panic.as_ref())),
        }
    }

    /// Cooperative `execute`: suspends on the admission gate, then runs
    /// `f` on the caller's thread at resumption.
    pub fn execute_async<T, F>(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        f: F,
    ) -> PoolExecuteAsync<R, T>
    where
        T: Send + 'static,
        F: FnOnce(&R) -> Result<T> + Send + 'static,
    {
        PoolExecuteAsync {
            core: Arc::clone(&self.core),
            acquire: self.acquire_async(priority, cancel),
            callable: Some(Box::new(f)),
            resource: None,
        }
    }

    /// Runs `f` with an acquired resource on a worker of the pool's task
    /// queue; the returned future suspends until the result is available.
    pub fn execute_background<T, F>(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        f: F,
    ) -> ExecuteBackground<T>
    where
        T: Send + 'static,
        F: FnOnce(&R) -> Result<T> + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let gate_cancel = cancel.cloned();
        self.core.queue.execute_background(priority, cancel, move || {
            let resource = PoolCore::acquire_resource(&core, priority, gate_cancel.as_ref())?;
            let result = catch_unwind(AssertUnwindSafe(|| f(&resource)));
            PoolCore::release_resource(&core, resource);
            match result {
                Ok(result) => result,
                Err(panic) => Err(Error::callback_panicked(panic.as_ref())),
            }
        })
    }

    /// Acquires a resource wrapped in a scope-bound claim that releases on
    /// drop.
    pub fn claim(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
    ) -> Result<ResourceClaim<R>> {
        let resource = self.acquire(priority, cancel)?;
        Ok(ResourceClaim::grant(Arc::clone(&self.core), resource))
    }

    /// Cooperative variant of [`ResourcePool::claim`].
    pub fn claim_async(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
    ) -> PoolClaimFuture<R> {
        PoolClaimFuture {
            core: Arc::clone(&self.core),
            acquire: self.acquire_async(priority, cancel),
        }
    }
}

impl<R: Send + Sync + 'static> Drop for ResourcePool<R> {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl<R: Send + Sync + 'static> std::fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("total", &self.num_resources())
            .field("idle", &self.num_idle())
            .field("active", &self.num_active())
            .finish()
    }
}

enum AcquireState {
    Init,
    Gating(LockFuture),
    Done,
}

/// Future returned by [`ResourcePool::acquire_async`].
#[must_use = "futures do nothing unless polled"]
pub struct PoolAcquireFuture<R: Send + Sync + 'static> {
    core: Arc<PoolCore<R>>,
    priority: i32,
    cancel: Option<CancelToken>,
    state: AcquireState,
}

impl<R: Send + Sync + 'static> Future for PoolAcquireFuture<R> {
    type Output = Result<Arc<R>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let core = Arc::clone(&self.core);
        loop {
            match &mut self.state {
                AcquireState::Init => {
                    if core.is_closed() {
                        self.state = AcquireState::Done;
                        return Poll::Ready(Err(Error::shut_down()));
                    }
                    match &core.gate {
                        Some(gate) => {
                            let lock = gate.lock_async(self.priority, self.cancel.as_ref());
                            self.state = AcquireState::Gating(lock);
                        }
                        None => {
                            self.state = AcquireState::Done;
                            let out = core.checkout(self.priority, self.cancel.as_ref());
                            return Poll::Ready(out);
                        }
                    }
                }
                AcquireState::Gating(lock) => {
                    let granted = ready!(Pin::new(lock).poll(cx));
                    self.state = AcquireState::Done;
                    return match granted {
                        Ok(()) => {
                            let out = core.checkout(self.priority, self.cancel.as_ref());
                            if out.is_err() {
                                if let Some(gate) = &core.gate {
                                    gate.unlock();
                                }
                            }
                            Poll::Ready(out)
                        }
                        Err(err) => Poll::Ready(Err(err)),
                    };
                }
                AcquireState::Done => return Poll::Pending,
            }
        }
    }
}

/// Future returned by [`ResourcePool::execute_async`].
#[must_use = "futures do nothing unless polled"]
pub struct PoolExecuteAsync<R: Send + Sync + 'static, T> {
    core: Arc<PoolCore<R>>,
    acquire: PoolAcquireFuture<R>,
    callable: Option<Box<dyn FnOnce(&R) -> Result<T> + Send>>,
    resource: Option<Arc<R>>,
}

impl<R: Send + Sync + 'static, T> Future for PoolExecuteAsync<R, T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.resource.is_none() {
            match ready!(Pin::new(&mut self.acquire).poll(cx)) {
                Ok(resource) => self.resource = Some(resource),
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
        let Some(f) = self.callable.take() else {
            return Poll::Ready(Err(Error::invalid_state(
                "execute_async polled after completion",
            )));
        };
        let resource = match self.resource.take() {
            Some(resource) => resource,
            None => return Poll::Ready(Err(Error::invalid_state("resource vanished"))),
        };
        let result = catch_unwind(AssertUnwindSafe(|| f(&resource)));
        PoolCore::release_resource(&self.core, resource);
        match result {
            Ok(result) => Poll::Ready(result),
            Err(panic) => Poll::Ready(Err(Error::callback_panicked(panic.as_ref()))),
        }
    }
}

impl<R: Send + Sync + 'static, T> Drop for PoolExecuteAsync<R, T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            PoolCore::release_resource(&self.core, resource);
        }
    }
}

/// Future returned by [`ResourcePool::claim_async`].
#[must_use = "futures do nothing unless polled"]
pub struct PoolClaimFuture<R: Send + Sync + 'static> {
    core: Arc<PoolCore<R>>,
    acquire: PoolAcquireFuture<R>,
}

impl<R: Send + Sync + 'static> Future for PoolClaimFuture<R> {
    type Output = Result<ResourceClaim<R>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.acquire).poll(cx)) {
            Ok(resource) => Poll::Ready(Ok(ResourceClaim::grant(
                Arc::clone(&self.core),
                resource,
            ))),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::VirtualClock;
    use std::sync::atomic::AtomicUsize;

    fn counting_pool(
        config: PoolConfig,
        clock: Arc<dyn TimeSource>,
    ) -> (ResourcePool<u64>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let pool = ResourcePool::build(
            Box::new(move |_, _| {
                Ok(counter.fetch_add(1, Ordering::SeqCst) as u64)
            }),
            config,
            TaskQueue::new(),
            clock,
        );
        (pool, built)
    }

    #[test]
    fn released_resource_is_recycled_before_the_factory_runs_again() {
        let (pool, built) = counting_pool(PoolConfig::default(), wall_clock());
        let first = pool.acquire(0, None).unwrap();
        let first_ptr = Arc::as_ptr(&first);
        pool.release(first);

        let second = pool.acquire(0, None).unwrap();
        assert_eq!(Arc::as_ptr(&second), first_ptr);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_resources(), 1);
        pool.release(second);
    }

    #[test]
    fn free_list_is_lifo() {
        let (pool, _) = counting_pool(PoolConfig::default(), wall_clock());
        let a = pool.acquire(0, None).unwrap();
        let b = pool.acquire(0, None).unwrap();
        let b_ptr = Arc::as_ptr(&b);
        pool.release(a);
        pool.release(b);
        // Most recently released comes back first.
        let next = pool.acquire(0, None).unwrap();
        assert_eq!(Arc::as_ptr(&next), b_ptr);
        pool.release(next);
    }

    #[test]
    fn capped_pool_blocks_at_capacity() {
        let (pool, _) = counting_pool(
            PoolConfig {
                max_resources: 1,
                ..PoolConfig::default()
            },
            wall_clock(),
        );
        let held = pool.acquire(0, None).unwrap();
        assert!(matches!(
            pool.try_acquire(),
            Err(TryAcquireError::WouldBlock)
        ));
        pool.release(held);
        let again = pool.try_acquire().unwrap();
        assert_eq!(pool.num_resources(), 1);
        pool.release(again);
    }

    #[test]
    fn factory_failure_releases_the_admission() {
        let flaky = AtomicUsize::new(0);
        let pool: ResourcePool<u64> = ResourcePool::build(
            Box::new(move |_, _| {
                if flaky.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::invalid_state("cold start"))
                } else {
                    Ok(99)
                }
            }),
            PoolConfig {
                max_resources: 1,
                ..PoolConfig::default()
            },
            TaskQueue::new(),
            wall_clock(),
        );
        let err = pool.acquire(0, None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FactoryFailed);
        assert_eq!(pool.num_resources(), 0);

        // The admission came back: the retry can proceed.
        let resource = pool.acquire(0, None).unwrap();
        assert_eq!(*resource, 99);
        pool.release(resource);
    }

    #[test]
    fn reaper_walks_the_lru_tail() {
        let clock = Arc::new(VirtualClock::new());
        let (pool, _) = counting_pool(
            PoolConfig {
                max_idle: Duration::from_secs(1),
                ..PoolConfig::default()
            },
            Arc::clone(&clock) as Arc<dyn TimeSource>,
        );
        let a = pool.acquire(0, None).unwrap();
        let b = pool.acquire(0, None).unwrap();
        pool.release(a);
        clock.advance(Duration::from_millis(600));
        pool.release(b);
        assert_eq!(pool.num_idle(), 2);

        // Only the tail entry has been idle past the threshold.
        clock.advance(Duration::from_millis(600));
        pool.core.reap_expired();
        assert_eq!(pool.num_resources(), 1);

        clock.advance(Duration::from_secs(1));
        pool.core.reap_expired();
        assert_eq!(pool.num_resources(), 0);
    }

    #[test]
    fn release_of_foreign_resource_is_a_logged_noop() {
        let (pool, _) = counting_pool(PoolConfig::default(), wall_clock());
        pool.release(Arc::new(123));
        assert_eq!(pool.num_resources(), 0);
    }

    #[test]
    fn execute_releases_even_when_the_callback_fails() {
        let (pool, _) = counting_pool(PoolConfig::default(), wall_clock());
        let err = pool
            .execute::<(), _>(0, None, |_| Err(Error::invalid_state("no")))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn claim_returns_resource_on_drop() {
        let (pool, _) = counting_pool(PoolConfig::default(), wall_clock());
        {
            let claim = pool.claim(0, None).unwrap();
            assert!(claim.is_active());
            assert_eq!(*claim.resource(), 0);
            assert_eq!(pool.num_active(), 1);
        }
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn invariant_idle_plus_active_equals_total() {
        let (pool, _) = counting_pool(PoolConfig::default(), wall_clock());
        let a = pool.acquire(0, None).unwrap();
        let b = pool.acquire(0, None).unwrap();
        pool.release(a);
        assert_eq!(pool.num_idle() + pool.num_active(), pool.num_resources());
        pool.release(b);
        assert_eq!(pool.num_idle() + pool.num_active(), pool.num_resources());
    }
}
