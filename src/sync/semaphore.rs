//! Counting semaphore built on the claim-gated task queue.
//!
//! The semaphore *is* a task queue whose dispatch is withheld while all
//! claims are held, so everything the queue gives — priority ordering,
//! FIFO fairness within a priority, cancellation, worker management — also
//! applies to lock acquisition: `lock` simply enqueues a grant record and
//! waits for the queue to dispatch it.
//!
//! `max_claims = 1` yields mutex semantics.
//!
//! # Claim accounting
//!
//! The claim counter lives inside the wait-queue's own mutex; taking an
//! entry and incrementing `claims` is one atomic step. Tasks submitted via
//! [`Semaphore::add`] or the `execute*` family hold their claim for the
//! duration of the callback and release it on the way out, success or
//! failure.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tracing::error;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::queue::completion::Completion;
use crate::queue::record::TaskPayload;
use crate::queue::task_queue::{fail_hook, QueueLink, TaskQueue};
use crate::queue::wait_queue::Wait;
use crate::queue::workers::ThreadConfig;
use crate::sync::claim::{SemaphoreClaim, SemaphoreClaimFuture};
use crate::time::{wall_clock, TimeSource};

/// Error returned by [`Semaphore::try_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryLockError {
    /// All claims are currently held.
    #[error("no claims available")]
    WouldBlock,
    /// The semaphore has been shut down.
    #[error("semaphore shut down")]
    Shutdown,
}

impl From<TryLockError> for Error {
    fn from(err: TryLockError) -> Self {
        match err {
            TryLockError::WouldBlock => Self::would_block(),
            TryLockError::Shutdown => Self::shut_down(),
        }
    }
}

/// A counting semaphore with priority-ordered, cancellable acquisition.
#[derive(Clone)]
pub struct Semaphore {
    queue: TaskQueue,
    clock: Arc<dyn TimeSource>,
}

impl Semaphore {
    /// Creates a semaphore with `max_claims` claims and the default thread
    /// policy.
    ///
    /// # Panics
    ///
    /// Panics if `max_claims` is 0.
    #[must_use]
    pub fn new(max_claims: usize) -> Self {
        Self::with_config(
            max_claims,
            ThreadConfig {
                name: "semaphore".to_string(),
                ..ThreadConfig::default()
            },
        )
    }

    /// Creates a semaphore with an explicit thread policy.
    ///
    /// # Panics
    ///
    /// Panics if `max_claims` is 0.
    #[must_use]
    pub fn with_config(max_claims: usize, config: ThreadConfig) -> Self {
        assert!(max_claims > 0, "max_claims must be at least 1");
        Self {
            queue: TaskQueue::gated(max_claims, config),
            clock: wall_clock(),
        }
    }

    /// Maximum number of concurrent claims.
    #[must_use]
    pub fn max_claims(&self) -> usize {
        self.queue.gate_stats().map_or(0, |(_, max)| max)
    }

    /// Claims currently held.
    #[must_use]
    pub fn claims(&self) -> usize {
        self.queue.gate_stats().map_or(0, |(held, _)| held)
    }

    /// Number of queued requests (grants and tasks).
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// `true` when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Acquires an anonymous claim, blocking until one is granted.
    ///
    /// Grants are dispatched in priority/age order with every other
    /// submission on this semaphore.
    pub fn lock(&self, priority: i32, cancel: Option<&CancelToken>) -> Result<()> {
        let completion = Arc::new(Completion::new());
        let payload = self.grant_payload(Arc::clone(&completion));
        let hook = fail_hook(Arc::clone(&completion));
        self.queue.submit_record(priority, cancel, payload, Some(hook))?;
        completion.wait()
    }

    /// Cooperative variant of [`Semaphore::lock`].
    pub fn lock_async(&self, priority: i32, cancel: Option<&CancelToken>) -> LockFuture {
        let completion = Arc::new(Completion::new());
        let payload = self.grant_payload(Arc::clone(&completion));
        let hook = fail_hook(Arc::clone(&completion));
        let link = self.queue.submit_linked(priority, cancel, payload, Some(hook));
        LockFuture {
            queue: self.queue.clone(),
            shared: completion,
            link,
            taken: false,
        }
    }

    /// Takes a claim immediately if one is free.
    ///
    /// This barges past queued requests; use [`Semaphore::lock`] when
    /// fairness matters.
    pub fn try_lock(&self) -> std::result::Result<(), TryLockError> {
        if self.queue.is_shut_down() {
            return Err(TryLockError::Shutdown);
        }
        if self.queue.try_claim() {
            Ok(())
        } else {
            Err(TryLockError::WouldBlock)
        }
    }

    /// Releases one claim and lets the queue dispatch a waiting request.
    ///
    /// An unlock with zero claims held is a violation: logged, then
    /// ignored.
    pub fn unlock(&self) {
        if !self.queue.release_claim() {
            error!("unlock with zero claims held");
            return;
        }
        self.queue.spawn_workers(-1);
    }

    /// Acquires a claim wrapped in a scope-bound handle that releases on
    /// drop.
    pub fn claim(&self, priority: i32, cancel: Option<&CancelToken>) -> Result<SemaphoreClaim> {
        self.lock(priority, cancel)?;
        Ok(SemaphoreClaim::grant(self.clone()))
    }

    /// Cooperative variant of [`Semaphore::claim`].
    pub fn claim_async(&self, priority: i32, cancel: Option<&CancelToken>) -> SemaphoreClaimFuture {
        SemaphoreClaimFuture::new(self.clone(), self.lock_async(priority, cancel))
    }

    /// Enqueues a task that runs while holding a claim; the claim is
    /// released when the task returns, success or failure.
    pub fn add<F>(&self, priority: i32, cancel: Option<&CancelToken>, mut task: F) -> Result<()>
    where
        F: FnMut() -> Result<bool> + Send + 'static,
    {
        let gate = self.clone();
        self.queue.submit_record(
            priority,
            cancel,
            Box::new(move || {
                let _claim = UnlockOnDrop(&gate);
                task()
            }),
            None,
        )
    }

    /// Runs `f` while holding a claim, blocking the caller for the result.
    pub fn execute<T, F>(&self, priority: i32, cancel: Option<&CancelToken>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let gate = self.clone();
        self.queue.execute(priority, cancel, move || {
            let _claim = UnlockOnDrop(&gate);
            f()
        })
    }

    /// Cooperative `execute`: suspends until a claim is granted, then runs
    /// `f` on the caller's thread at resumption, releasing the claim after.
    pub fn execute_async<T, F>(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        f: F,
    ) -> SemaphoreExecuteAsync<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        SemaphoreExecuteAsync {
            lock: self.lock_async(priority, cancel),
            sem: self.clone(),
            callable: Some(Box::new(f)),
            granted: false,
        }
    }

    /// Runs `f` on a worker thread while holding a claim; the returned
    /// future suspends until the result is available.
    pub fn execute_background<T, F>(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        f: F,
    ) -> crate::queue::task_queue::ExecuteBackground<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let gate = self.clone();
        self.queue.execute_background(priority, cancel, move || {
            let _claim = UnlockOnDrop(&gate);
            f()
        })
    }

    /// Polls the queue once; a request is dispatched only while a claim is
    /// available. See [`TaskQueue::process`].
    pub fn process(&self, wait: Wait) -> bool {
        self.queue.process(wait)
    }

    /// Shuts down the underlying queue; pending requests fail with
    /// `Shutdown`.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// The underlying task queue (thread observers, cap adjustment).
    #[must_use]
    pub fn task_queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub(crate) fn clock(&self) -> &Arc<dyn TimeSource> {
        &self.clock
    }

    fn grant_payload(&self, completion: Arc<Completion<()>>) -> TaskPayload {
        let gate = self.queue.clone();
        Box::new(move || {
            if !completion.complete(Ok(())) {
                // The caller abandoned the wait between dispatch and
                // delivery; hand the claim straight back.
                gate.release_claim();
                gate.spawn_workers(-1);
            }
            Ok(false)
        })
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("claims", &self.claims())
            .field("max_claims", &self.max_claims())
            .field("queued", &self.len())
            .finish()
    }
}

/// Releases one claim on drop; used to wrap dispatched callbacks.
struct UnlockOnDrop<'a>(&'a Semaphore);

impl Drop for UnlockOnDrop<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Future returned by [`Semaphore::lock_async`].
///
/// Dropping the future before observing the grant releases any claim that
/// was already dispatched to it.
#[must_use = "futures do nothing unless polled"]
pub struct LockFuture {
    queue: TaskQueue,
    shared: Arc<Completion<()>>,
    link: QueueLink,
    taken: bool,
}

impl Future for LockFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shared.poll_take(cx) {
            Poll::Ready(Ok(())) => {
                self.taken = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LockFuture {
    fn drop(&mut self) {
        if self.taken {
            return;
        }
        self.link.detach();
        if let Some(Ok(())) = self.shared.abandon() {
            // Granted but never observed.
            self.queue.release_claim();
            self.queue.spawn_workers(-1);
        }
    }
}

/// Future returned by [`Semaphore::execute_async`].
#[must_use = "futures do nothing unless polled"]
pub struct SemaphoreExecuteAsync<T> {
    lock: LockFuture,
    sem: Semaphore,
    callable: Option<Box<dyn FnOnce() -> Result<T> + Send>>,
    granted: bool,
}

impl<T> Future for SemaphoreExecuteAsync<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.granted {
            if let Err(err) = ready!(Pin::new(&mut self.lock).poll(cx)) {
                return Poll::Ready(Err(err));
            }
            self.granted = true;
        }
        let Some(f) = self.callable.take() else {
            return Poll::Ready(Err(Error::invalid_state(
                "execute_async polled after completion",
            )));
        };
        let result = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(panic) => Err(Error::callback_panicked(panic.as_ref())),
        };
        self.sem.unlock();
        Poll::Ready(result)
    }
}

impl<T> Drop for SemaphoreExecuteAsync<T> {
    fn drop(&mut self) {
        // A grant that was observed but whose callable never ran must
        // still be released; LockFuture handles the unobserved cases.
        if self.granted && self.callable.is_some() {
            self.sem.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::IdleLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn worker_config(name: &str) -> ThreadConfig {
        ThreadConfig {
            name: name.to_string(),
            max_threads: 4,
            max_idle: Wait::For(Duration::from_millis(50)),
        }
    }

    #[test]
    fn lock_then_unlock_round_trips_the_counter() {
        let sem = Semaphore::with_config(2, worker_config("lk"));
        sem.lock(0, None).unwrap();
        sem.lock(0, None).unwrap();
        assert_eq!(sem.claims(), 2);
        sem.unlock();
        sem.unlock();
        assert_eq!(sem.claims(), 0);
        sem.shutdown();
    }

    #[test]
    fn claims_never_exceed_max() {
        let sem = Semaphore::with_config(1, worker_config("cap"));
        sem.lock(0, None).unwrap();
        assert!(matches!(sem.try_lock(), Err(TryLockError::WouldBlock)));

        // A queued lock is only granted after the unlock.
        let pending = sem.lock_async(0, None);
        assert_eq!(sem.claims(), 1);
        sem.unlock();
        IdleLoop::new().block_on(pending).unwrap();
        assert_eq!(sem.claims(), 1);
        sem.unlock();
        sem.shutdown();
    }

    #[test]
    fn unlock_without_claim_is_a_logged_noop() {
        let sem = Semaphore::with_config(1, worker_config("noop"));
        sem.unlock();
        assert_eq!(sem.claims(), 0);
        sem.shutdown();
    }

    #[test]
    fn add_releases_the_claim_after_the_task() {
        let sem = Semaphore::with_config(1, worker_config("add"));
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);
        sem.add(0, None, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .unwrap();
        while ran.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        // The wrapping guarantees the claim comes back.
        sem.lock(0, None).unwrap();
        sem.unlock();
        sem.shutdown();
    }

    #[test]
    fn execute_failure_still_releases_the_claim() {
        let sem = Semaphore::with_config(1, worker_config("fail"));
        let err = sem
            .execute::<(), _>(0, None, || Err(Error::invalid_state("boom")))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
        assert_eq!(sem.claims(), 0);
        sem.shutdown();
    }

    #[test]
    fn cancelled_queued_lock_reports_cancelled() {
        let sem = Semaphore::with_config(1, worker_config("cxl"));
        sem.lock(0, None).unwrap();
        let token = CancelToken::new();
        let pending = sem.lock_async(0, Some(&token));
        token.cancel();
        let err = IdleLoop::new().block_on(pending).unwrap_err();
        assert!(err.is_cancelled());
        sem.unlock();
        assert_eq!(sem.claims(), 0);
        sem.shutdown();
    }

    #[test]
    fn dropped_lock_future_returns_the_claim() {
        let sem = Semaphore::with_config(1, worker_config("drop"));
        {
            let pending = sem.lock_async(0, None);
            // Give the grant time to land, observed or not.
            std::thread::sleep(Duration::from_millis(30));
            drop(pending);
        }
        // If the grant leaked, this would deadlock.
        sem.lock(0, None).unwrap();
        sem.unlock();
        sem.shutdown();
    }

    #[test]
    fn execute_async_runs_on_the_polling_thread() {
        let sem = Semaphore::with_config(1, worker_config("ex"));
        let host = std::thread::current().id();
        let value = IdleLoop::new()
            .block_on(sem.execute_async(0, None, move || {
                assert_eq!(std::thread::current().id(), host);
                Ok(11)
            }))
            .unwrap();
        assert_eq!(value, 11);
        assert_eq!(sem.claims(), 0);
        sem.shutdown();
    }
}
