//! The task queue: priority-ordered, cancellable dispatch with managed
//! workers.
//!
//! Submissions enter the wait-queue as [`TaskRecord`]s; workers (or any
//! external caller) drain them through [`TaskQueue::process`]. Three
//! execution modes sit on top of `add`:
//!
//! - [`TaskQueue::execute`] blocks the calling thread until the callable
//!   has run on a worker.
//! - [`TaskQueue::execute_async`] suspends cooperatively; the callable runs
//!   on the caller's host thread when the dispatch resumes it.
//! - [`TaskQueue::execute_background`] suspends cooperatively; the callable
//!   runs on a worker thread and only the result crosses back.
//!
//! # Deadlock
//!
//! `execute` must not be called from the only thread that services the
//! queue: the call would wait for a dispatch that only itself could run.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, trace};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::queue::completion::Completion;
use crate::queue::record::{DropHook, TaskPayload, TaskRecord};
use crate::queue::wait_queue::{OfferOutcome, Slot, Wait, WaitQueue};
use crate::queue::workers::{ThreadConfig, ThreadState};

/// Priority used by callers that do not care; lower values dispatch first.
pub const PRIORITY_DEFAULT: i32 = 0;

pub(crate) struct QueueCore {
    queue: Arc<WaitQueue<TaskRecord>>,
    threads: ThreadState,
}

/// A priority task queue with managed worker threads.
///
/// Cloning yields another handle to the same queue. Workers hold their own
/// handle to the core while they live, so a queue whose workers never
/// retire must be shut down explicitly with [`TaskQueue::shutdown`].
#[derive(Clone)]
pub struct TaskQueue {
    core: Arc<QueueCore>,
}

impl TaskQueue {
    /// Creates a queue with the default thread policy (unlimited workers,
    /// 10 s idle retirement).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ThreadConfig::default())
    }

    /// Creates a queue with an explicit thread policy.
    #[must_use]
    pub fn with_config(config: ThreadConfig) -> Self {
        Self {
            core: Arc::new(QueueCore {
                queue: Arc::new(WaitQueue::new()),
                threads: ThreadState::new(config),
            }),
        }
    }

    /// A queue whose dispatch is gated by a claim counter; the semaphore's
    /// substrate.
    pub(crate) fn gated(max_claims: usize, config: ThreadConfig) -> Self {
        Self {
            core: Arc::new(QueueCore {
                queue: Arc::new(WaitQueue::with_gate(max_claims)),
                threads: ThreadState::new(config),
            }),
        }
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.queue.len()
    }

    /// `true` when no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of worker threads (busy or idle).
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.core.threads.num_threads()
    }

    /// Worker threads currently waiting for work.
    #[must_use]
    pub fn idle_threads(&self) -> usize {
        self.core.threads.idle_threads()
    }

    /// The worker cap; `-1` means unlimited.
    #[must_use]
    pub fn max_threads(&self) -> i32 {
        self.core.threads.max_threads()
    }

    /// Raises the worker cap to `n` if the current cap is positive and
    /// smaller; unlimited and zero caps are left alone.
    pub fn increase_max_threads(&self, n: i32) {
        self.core.threads.increase_max_threads(n);
    }

    /// `true` once [`TaskQueue::shutdown`] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.core.queue.is_closed()
    }

    /// Enqueues a task.
    ///
    /// The task returns `Ok(true)` to be re-enqueued (with a fresh age at
    /// the same priority) after this dispatch, `Ok(false)` to be dropped.
    /// A cancellation fired before dispatch removes the task without
    /// running it; submitting with an already-cancelled token is refused.
    pub fn add<F>(&self, priority: i32, cancel: Option<&CancelToken>, task: F) -> Result<()>
    where
        F: FnMut() -> Result<bool> + Send + 'static,
    {
        self.submit_record(priority, cancel, Box::new(task), None)
    }

    /// Polls the queue once, running the next task if one becomes
    /// dispatchable within `wait`.
    ///
    /// Returns `true` on a dispatch, `false` on timeout, empty queue, or
    /// shutdown. Workers loop on this; external callers may drive it too.
    pub fn process(&self, wait: Wait) -> bool {
        process_core(&self.core, wait)
    }

    /// Runs `f` on a worker and blocks until its result is available.
    ///
    /// The callable's failure is propagated verbatim; a panic surfaces as
    /// `CallbackFailed`; a cancellation before dispatch as `Cancelled`.
    pub fn execute<T, F>(&self, priority: i32, cancel: Option<&CancelToken>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let payload = once_payload(Arc::clone(&completion), f);
        let hook = fail_hook(Arc::clone(&completion));
        self.submit_record(priority, cancel, payload, Some(hook))?;
        completion.wait()
    }

    /// Cooperative variant of [`TaskQueue::execute`]: the returned future
    /// suspends until the queue dispatches its turn, then runs `f` on the
    /// caller's own thread at resumption.
    pub fn execute_async<T, F>(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        f: F,
    ) -> ExecuteAsync<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let ready = Arc::clone(&completion);
        let payload: TaskPayload = Box::new(move || {
            ready.complete(Ok(()));
            Ok(false)
        });
        let hook = fail_hook(Arc::clone(&completion));
        let (_, link) = self.submit_inner(priority, cancel, payload, Some(hook));
        ExecuteAsync {
            shared: completion,
            callable: Some(Box::new(f)),
            link,
        }
    }

    /// Runs `f` on a worker thread; the returned future suspends until the
    /// result is available.
    pub fn execute_background<T, F>(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        f: F,
    ) -> ExecuteBackground<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let payload = once_payload(Arc::clone(&completion), f);
        let hook = fail_hook(Arc::clone(&completion));
        let (_, link) = self.submit_inner(priority, cancel, payload, Some(hook));
        ExecuteBackground {
            shared: completion,
            link,
        }
    }

    /// Closes the queue: pending tasks fail with `Shutdown`, blocked
    /// consumers wake, and workers retire as they observe the close.
    pub fn shutdown(&self) {
        debug!("task queue shutting down");
        for record in self.core.queue.close() {
            record.fail(Error::shut_down());
        }
    }

    /// Spawns workers against current demand; `max_new < 0` means "as many
    /// as useful". Returns the number started.
    pub(crate) fn spawn_workers(&self, max_new: i64) -> usize {
        let demand = self.core.queue.demand();
        let count = self.core.threads.reserve(max_new, demand);
        let mut started = 0;
        for _ in 0..count {
            let core = Arc::clone(&self.core);
            let name = self.core.threads.next_worker_name();
            match thread::Builder::new().name(name).spawn(move || worker_loop(core)) {
                Ok(_) => started += 1,
                Err(err) => {
                    error!(%err, "failed to start worker thread");
                    self.core.threads.unreserve(count - started);
                    break;
                }
            }
        }
        started
    }

    pub(crate) fn submit_record(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        payload: TaskPayload,
        on_drop: Option<DropHook>,
    ) -> Result<()> {
        self.submit_inner(priority, cancel, payload, on_drop).0
    }

    pub(crate) fn submit_linked(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        payload: TaskPayload,
        on_drop: Option<DropHook>,
    ) -> QueueLink {
        self.submit_inner(priority, cancel, payload, on_drop).1
    }

    fn submit_inner(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        payload: TaskPayload,
        on_drop: Option<DropHook>,
    ) -> (Result<()>, QueueLink) {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                error!("submission with an already-cancelled token");
                if let Some(hook) = on_drop {
                    hook(Error::cancelled());
                }
                return (Err(Error::cancelled()), QueueLink::empty());
            }
        }
        let slot = Slot::new();
        let mut record = TaskRecord::new(payload, Arc::clone(&slot), on_drop);
        if let Some(token) = cancel {
            let id =
                WaitQueue::attach_cancel(&self.core.queue, token, &slot, |record: TaskRecord| {
                    record.fail(Error::cancelled());
                });
            record.set_cancel(token.clone(), id);
        }
        match slot.offer_link(self.core.queue.as_ref(), priority, record) {
            OfferOutcome::Queued(offered) => {
                if offered.consumer_shortage {
                    trace!(priority, "no idle consumer for new task");
                }
                self.spawn_workers(-1);
                (
                    Ok(()),
                    QueueLink {
                        queue: Arc::downgrade(&self.core.queue),
                        slot: Some(slot),
                    },
                )
            }
            OfferOutcome::CancelledEarly(record) => {
                record.fail(Error::cancelled());
                (Err(Error::cancelled()), QueueLink::empty())
            }
            OfferOutcome::Closed(record) => {
                record.fail(Error::shut_down());
                (Err(Error::shut_down()), QueueLink::empty())
            }
        }
    }

    pub(crate) fn release_claim(&self) -> bool {
        self.core.queue.release_claim()
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.core.queue.try_claim()
    }

    pub(crate) fn gate_stats(&self) -> Option<(usize, usize)> {
        self.core.queue.gate_stats()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .field("num_threads", &self.num_threads())
            .field("idle_threads", &self.idle_threads())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Returns the process-wide default queue, creating it on first use.
///
/// The instance is held behind a weak reference: once every handle (and
/// every retired worker) is gone it is reclaimed, and the next call builds
/// a fresh one.
#[must_use]
pub fn default_queue() -> TaskQueue {
    static DEFAULT: Mutex<Weak<QueueCore>> = Mutex::new(Weak::new());
    let mut slot = match DEFAULT.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(core) = slot.upgrade() {
        return TaskQueue { core };
    }
    let queue = TaskQueue::with_config(ThreadConfig {
        name: "taskloom-default".to_string(),
        ..ThreadConfig::default()
    });
    *slot = Arc::downgrade(&queue.core);
    queue
}

fn worker_loop(core: Arc<QueueCore>) {
    core.threads.register_current();
    debug!("worker started");
    loop {
        let wait = core.threads.idle_wait();
        if process_core(&core, wait) {
            continue;
        }
        // Timed out (or closed). Re-check demand under the counter lock so
        // a task that raced the timeout is not stranded with a worker that
        // the spawn policy still counts as idle.
        if core.threads.try_retire_current(core.queue.demand()) {
            break;
        }
    }
    debug!("worker retired");
}

fn process_core(core: &Arc<QueueCore>, wait: Wait) -> bool {
    let deadline = match wait {
        Wait::For(d) => Some(Instant::now() + d),
        _ => None,
    };
    loop {
        let step_wait = match (wait, deadline) {
            (Wait::For(_), Some(d)) => {
                let now = Instant::now();
                if now >= d {
                    Wait::None
                } else {
                    Wait::For(d - now)
                }
            }
            _ => wait,
        };
        let Some((key, mut record)) = core.queue.poll_timed(step_wait) else {
            return false;
        };
        record.begin_dispatch();
        if record.is_cancelled() {
            // The claim taken with the poll (on a gated queue) belongs to a
            // dispatch that will never run.
            core.queue.release_claim();
            record.fail(Error::cancelled());
            continue;
        }
        let outcome = core.threads.run_task(|| record.execute());
        match outcome {
            Ok(true) => {
                if record.is_cancelled() {
                    drop(record);
                } else {
                    let slot = Arc::clone(record.slot());
                    match slot.offer_link(core.queue.as_ref(), key.priority, record) {
                        OfferOutcome::Queued(_) => {}
                        OfferOutcome::CancelledEarly(record) | OfferOutcome::Closed(record) => {
                            drop(record);
                        }
                    }
                }
            }
            Ok(false) => {}
            Err(err) => {
                debug!(%err, "queued task failed");
            }
        }
        return true;
    }
}

pub(crate) fn once_payload<T, F>(completion: Arc<Completion<T>>, f: F) -> TaskPayload
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let mut f = Some(f);
    Box::new(move || {
        if let Some(f) = f.take() {
            let result = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(result) => result,
                Err(panic) => Err(Error::callback_panicked(panic.as_ref())),
            };
            completion.complete(result);
        }
        Ok(false)
    })
}

pub(crate) fn fail_hook<T: Send + 'static>(completion: Arc<Completion<T>>) -> DropHook {
    Box::new(move |err| {
        completion.complete(Err(err));
    })
}

/// Back-reference from an in-flight future to its queued record, so a
/// dropped future removes the record instead of leaking a dispatch.
pub(crate) struct QueueLink {
    queue: Weak<WaitQueue<TaskRecord>>,
    slot: Option<Arc<Slot>>,
}

impl QueueLink {
    pub(crate) fn empty() -> Self {
        Self {
            queue: Weak::new(),
            slot: None,
        }
    }

    pub(crate) fn detach(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Some(key) = slot.take_queued() {
                if let Some(queue) = self.queue.upgrade() {
                    drop(queue.remove(key));
                }
            }
        }
    }
}

/// Future returned by [`TaskQueue::execute_async`].
///
/// Resolves once the queue has dispatched this submission's turn; the
/// callable then runs on the polling thread.
#[must_use = "futures do nothing unless polled"]
pub struct ExecuteAsync<T> {
    shared: Arc<Completion<()>>,
    callable: Option<Box<dyn FnOnce() -> Result<T> + Send>>,
    link: QueueLink,
}

impl<T> Future for ExecuteAsync<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shared.poll_take(cx) {
            Poll::Ready(Ok(())) => {
                let Some(f) = self.callable.take() else {
                    return Poll::Ready(Err(Error::invalid_state(
                        "execute_async polled after completion",
                    )));
                };
                let result = match catch_unwind(AssertUnwindSafe(f)) {
                    Ok(result) => result,
                    Err(panic) => Err(Error::callback_panicked(panic.as_ref())),
                };
                Poll::Ready(result)
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for ExecuteAsync<T> {
    fn drop(&mut self) {
        self.link.detach();
        self.shared.abandon();
    }
}

/// Future returned by [`TaskQueue::execute_background`].
#[must_use = "futures do nothing unless polled"]
pub struct ExecuteBackground<T> {
    shared: Arc<Completion<T>>,
    link: QueueLink,
}

impl<T> Future for ExecuteBackground<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.poll_take(cx)
    }
}

impl<T> Drop for ExecuteBackground<T> {
    fn drop(&mut self) {
        self.link.detach();
        self.shared.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn external_queue() -> TaskQueue {
        TaskQueue::with_config(ThreadConfig::external_only("test"))
    }

    #[test]
    fn process_dispatches_in_priority_then_fifo_order() {
        let queue = external_queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (priority, label) in [(5, "one"), (5, "two"), (1, "first"), (9, "last")] {
            let seen = Arc::clone(&seen);
            queue
                .add(priority, None, move || {
                    seen.lock().unwrap().push(label);
                    Ok(false)
                })
                .unwrap();
        }
        while queue.process(Wait::None) {}
        assert_eq!(*seen.lock().unwrap(), vec!["first", "one", "two", "last"]);
    }

    #[test]
    fn requeueing_task_runs_again_with_fresh_age() {
        let queue = external_queue();
        let remaining = Arc::new(AtomicUsize::new(3));
        let counter = Arc::clone(&remaining);
        queue
            .add(0, None, move || {
                Ok(counter.fetch_sub(1, Ordering::SeqCst) > 1)
            })
            .unwrap();
        let mut dispatches = 0;
        while queue.process(Wait::None) {
            dispatches += 1;
        }
        assert_eq!(dispatches, 3);
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn workers_drain_the_queue_without_help() {
        let queue = TaskQueue::with_config(ThreadConfig {
            name: "auto".into(),
            max_threads: 2,
            max_idle: Wait::For(Duration::from_millis(50)),
        });
        let value = queue
            .execute(0, None, || Ok("computed"))
            .unwrap();
        assert_eq!(value, "computed");
        queue.shutdown();
    }

    #[test]
    fn execute_propagates_callback_failure() {
        let queue = TaskQueue::with_config(ThreadConfig {
            name: "fail".into(),
            max_threads: 1,
            max_idle: Wait::For(Duration::from_millis(50)),
        });
        let err = queue
            .execute::<(), _>(0, None, || Err(Error::invalid_state("sabotage")))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);

        let err = queue
            .execute::<(), _>(0, None, || panic!("kaboom"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CallbackFailed);
        queue.shutdown();
    }

    #[test]
    fn cancelled_submission_never_runs_and_reports_cancelled() {
        let queue = external_queue();
        let token = CancelToken::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&ran);
        queue
            .add(0, Some(&token), move || {
                observed.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            })
            .unwrap();
        token.cancel();
        assert!(!queue.process(Wait::None));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn already_cancelled_token_is_refused() {
        let queue = external_queue();
        let token = CancelToken::new();
        token.cancel();
        let err = queue.add(0, Some(&token), || Ok(false)).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn shutdown_fails_pending_execute() {
        let queue = external_queue();
        let pending = queue.execute_background(0, None, || Ok(1));
        queue.shutdown();
        let result = crate::idle::IdleLoop::new().block_on(pending);
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::Shutdown);
        assert!(queue.add(0, None, || Ok(false)).is_err());
    }

    #[test]
    fn default_queue_is_shared_and_reclaimable() {
        let a = default_queue();
        let b = default_queue();
        assert!(Arc::ptr_eq(&a.core, &b.core));
    }
}
