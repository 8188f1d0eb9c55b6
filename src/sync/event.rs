//! Event: a multicast signal carrying a payload, with per-subscriber
//! dispatch modes.
//!
//! Waiters sit in the event's own priority wait-queue. [`Event::trigger`]
//! drains a snapshot of the currently attached waiters and dispatches each
//! exactly once in priority/age order; waiters attached during the
//! dispatch participate in the next trigger. A waiter whose dispatch says
//! "keep me" is re-attached (with a fresh age) for subsequent triggers.
//!
//! # Idle-callback reentrancy
//!
//! Subscribers registered with [`Event::add`] dispatch via idle callbacks
//! on the host they were registered under. A later trigger may enqueue a
//! new idle callback before an earlier one has run, so a subscriber can be
//! invoked again after returning `false`. Callers that need strict
//! one-shot behavior fire a cancellation token from the callback.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};

use smallvec::SmallVec;
use tracing::error;

use crate::cancel::{CallbackId, CancelToken};
use crate::error::{Error, Result};
use crate::idle;
use crate::queue::completion::Completion;
use crate::queue::task_queue::{default_queue, fail_hook, once_payload, TaskQueue};
use crate::queue::wait_queue::{OfferOutcome, Slot, Wait, WaitQueue};

struct Waiter<P> {
    dispatch: Box<dyn FnMut(&P) -> bool + Send>,
    on_cancel: Option<Box<dyn FnOnce(Error) + Send>>,
    slot: Arc<Slot>,
    cancel: Option<(CancelToken, CallbackId)>,
}

impl<P> Waiter<P> {
    fn new(dispatch: Box<dyn FnMut(&P) -> bool + Send>) -> Self {
        Self {
            dispatch,
            on_cancel: None,
            slot: Slot::new(),
            cancel: None,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|(token, _)| token.is_cancelled())
    }

    fn fail(mut self, err: Error) {
        if let Some(hook) = self.on_cancel.take() {
            hook(err);
        }
    }
}

impl<P> Drop for Waiter<P> {
    fn drop(&mut self) {
        if let Some((token, id)) = self.cancel.take() {
            token.disconnect(id);
        }
    }
}

struct TriggerState<P> {
    triggered: bool,
    retained: Option<P>,
}

struct EventCore<P: Clone + Send + 'static> {
    waiters: Arc<WaitQueue<Waiter<P>>>,
    state: parking_lot::Mutex<TriggerState<P>>,
    auto_reset: bool,
    queue: OnceLock<TaskQueue>,
}

impl<P: Clone + Send + 'static> EventCore<P> {
    fn background_queue(&self) -> TaskQueue {
        self.queue.get_or_init(default_queue).clone()
    }
}

/// A fire-and-dispatch signal carrying a payload of type `P`.
///
/// Cloning yields another handle to the same event.
#[derive(Clone)]
pub struct Event<P: Clone + Send + 'static> {
    core: Arc<EventCore<P>>,
}

impl<P: Clone + Send + 'static> Event<P> {
    /// An auto-reset event: `triggered` clears once a trigger's dispatch
    /// completes.
    #[must_use]
    pub fn new() -> Self {
        Self::build(true, None)
    }

    /// A manual-reset event: `triggered` stays set (and the payload is
    /// retained) until [`Event::reset`]; waiters attached while set are
    /// dispatched immediately.
    #[must_use]
    pub fn manual_reset() -> Self {
        Self::build(false, None)
    }

    /// An auto-reset event whose background mappers run on `queue`.
    #[must_use]
    pub fn with_queue(queue: TaskQueue) -> Self {
        Self::build(true, Some(queue))
    }

    fn build(auto_reset: bool, queue: Option<TaskQueue>) -> Self {
        let cell = OnceLock::new();
        if let Some(queue) = queue {
            let _ = cell.set(queue);
        }
        Self {
            core: Arc::new(EventCore {
                waiters: Arc::new(WaitQueue::new()),
                state: parking_lot::Mutex::new(TriggerState {
                    triggered: false,
                    retained: None,
                }),
                auto_reset,
                queue: cell,
            }),
        }
    }

    /// `true` while the event is in the triggered state.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.core.state.lock().triggered
    }

    /// Number of currently attached waiters.
    #[must_use]
    pub fn num_waiters(&self) -> usize {
        self.core.waiters.len()
    }

    /// Clears a manual-reset event.
    pub fn reset(&self) {
        let mut state = self.core.state.lock();
        state.triggered = false;
        state.retained = None;
    }

    /// Fires the event: every waiter attached at this moment is dispatched
    /// exactly once with `payload`, in priority/age order.
    pub fn trigger(&self, payload: P) {
        {
            let mut state = self.core.state.lock();
            state.triggered = true;
            state.retained = Some(payload.clone());
        }
        let mut snapshot: SmallVec<[(i32, Waiter<P>); 8]> = SmallVec::new();
        while let Some((key, waiter)) = self.core.waiters.poll_timed(Wait::None) {
            waiter.slot.begin_dispatch();
            snapshot.push((key.priority, waiter));
        }
        for (priority, mut waiter) in snapshot {
            if waiter.is_cancelled() {
                waiter.fail(Error::cancelled());
                continue;
            }
            let keep = (waiter.dispatch)(&payload);
            if keep && !waiter.is_cancelled() {
                let slot = Arc::clone(&waiter.slot);
                match slot.offer_link(self.core.waiters.as_ref(), priority, waiter) {
                    OfferOutcome::Queued(_) => {}
                    OfferOutcome::CancelledEarly(waiter) | OfferOutcome::Closed(waiter) => {
                        drop(waiter);
                    }
                }
            }
        }
        if self.core.auto_reset {
            self.reset();
        }
    }

    /// Attaches a persistent subscriber.
    ///
    /// On each trigger the callback is scheduled on an idle step of the
    /// host the *registering* thread was bound to (or runs inline during
    /// `trigger` when no host is bound). Returning `false` detaches it;
    /// see the module notes on reentrancy.
    pub fn add<F>(&self, priority: i32, cancel: Option<&CancelToken>, callback: F) -> Result<()>
    where
        F: FnMut(P) -> bool + Send + 'static,
    {
        let callback = Arc::new(parking_lot::Mutex::new(callback));
        let slot = Slot::new();
        let detach = DetachLink {
            queue: Arc::downgrade(&self.core.waiters),
            slot: Arc::clone(&slot),
        };
        let dispatch: Box<dyn FnMut(&P) -> bool + Send> = match idle::current() {
            Some(sched) => Box::new(move |payload: &P| {
                let callback = Arc::clone(&callback);
                let payload = payload.clone();
                let detach = detach.clone();
                sched.schedule(
                    priority,
                    Box::new(move || {
                        let keep = (callback.lock())(payload.clone());
                        if !keep {
                            detach.detach();
                        }
                        false
                    }),
                );
                true
            }),
            None => Box::new(move |payload: &P| (callback.lock())(payload.clone())),
        };
        let mut waiter = Waiter::new(dispatch);
        waiter.slot = slot;
        self.register(priority, cancel, waiter).map(|_| ())
    }

    /// Blocks the caller until the next trigger; `mapper` receives the
    /// payload and its result is returned. One-shot.
    pub fn execute<T, F>(&self, priority: i32, cancel: Option<&CancelToken>, mapper: F) -> Result<T>
    where
        F: FnOnce(P) -> Result<T>,
    {
        let completion = Arc::new(Completion::new());
        let deliver = Arc::clone(&completion);
        let mut waiter = Waiter::new(Box::new(move |payload: &P| {
            deliver.complete(Ok(payload.clone()));
            false
        }));
        waiter.on_cancel = Some(fail_hook(Arc::clone(&completion)));
        self.register(priority, cancel, waiter)?;
        let payload = completion.wait()?;
        mapper(payload)
    }

    /// Cooperative variant of [`Event::execute`]: suspends until the next
    /// trigger, then runs `mapper` on the caller's thread at resumption.
    /// One-shot.
    pub fn execute_async<T, F>(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        mapper: F,
    ) -> EventExecuteAsync<P, T>
    where
        T: Send + 'static,
        F: FnOnce(P) -> Result<T> + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let deliver = Arc::clone(&completion);
        let mut waiter = Waiter::new(Box::new(move |payload: &P| {
            deliver.complete(Ok(payload.clone()));
            false
        }));
        waiter.on_cancel = Some(fail_hook(Arc::clone(&completion)));
        let link = DetachLink {
            queue: Arc::downgrade(&self.core.waiters),
            slot: Arc::clone(&waiter.slot),
        };
        let _ = self.register(priority, cancel, waiter);
        EventExecuteAsync {
            shared: completion,
            mapper: Some(Box::new(mapper)),
            link,
        }
    }

    /// After the next trigger, runs `mapper` on a worker of the event's
    /// task queue; the returned future suspends until the result is
    /// available. Mapper failure is propagated. One-shot.
    pub fn execute_background<T, F>(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        mapper: F,
    ) -> EventExecuteBackground<P, T>
    where
        T: Send + 'static,
        F: FnOnce(P) -> Result<T> + Send + 'static,
    {
        let completion: Arc<Completion<T>> = Arc::new(Completion::new());
        let queue = self.core.background_queue();
        let job_cancel = cancel.cloned();
        let deliver = Arc::clone(&completion);
        let mut mapper_cell = Some(mapper);
        let mut waiter = Waiter::new(Box::new(move |payload: &P| {
            let Some(mapper) = mapper_cell.take() else {
                return false;
            };
            let payload = payload.clone();
            let job = once_payload(Arc::clone(&deliver), move || mapper(payload));
            let hook = fail_hook(Arc::clone(&deliver));
            // A refused submission already failed the completion via the
            // hook; nothing further to surface here.
            let _ = queue.submit_record(priority, job_cancel.as_ref(), job, Some(hook));
            false
        }));
        waiter.on_cancel = Some(fail_hook(Arc::clone(&completion)));
        let link = DetachLink {
            queue: Arc::downgrade(&self.core.waiters),
            slot: Arc::clone(&waiter.slot),
        };
        let _ = self.register(priority, cancel, waiter);
        EventExecuteBackground {
            shared: completion,
            link,
        }
    }

    fn register(
        &self,
        priority: i32,
        cancel: Option<&CancelToken>,
        mut waiter: Waiter<P>,
    ) -> Result<()> {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                error!("event subscription with an already-cancelled token");
                waiter.fail(Error::cancelled());
                return Err(Error::cancelled());
            }
        }
        let mut state = self.core.state.lock();
        if state.triggered && !self.core.auto_reset {
            let payload = state.retained.clone();
            drop(state);
            if let Some(payload) = payload {
                let keep = (waiter.dispatch)(&payload);
                if !keep {
                    return Ok(());
                }
            }
            state = self.core.state.lock();
        }
        if let Some(token) = cancel {
            let id = WaitQueue::attach_cancel(
                &self.core.waiters,
                token,
                &waiter.slot,
                |waiter: Waiter<P>| {
                    waiter.fail(Error::cancelled());
                },
            );
            waiter.cancel = Some((token.clone(), id));
        }
        let slot = Arc::clone(&waiter.slot);
        let outcome = slot.offer_link(self.core.waiters.as_ref(), priority, waiter);
        drop(state);
        match outcome {
            OfferOutcome::Queued(_) => Ok(()),
            OfferOutcome::CancelledEarly(waiter) => {
                waiter.fail(Error::cancelled());
                Err(Error::cancelled())
            }
            OfferOutcome::Closed(waiter) => {
                waiter.fail(Error::shut_down());
                Err(Error::shut_down())
            }
        }
    }
}

impl<P: Clone + Send + 'static> Default for Event<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone + Send + 'static> std::fmt::Debug for Event<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("triggered", &self.is_triggered())
            .field("waiters", &self.num_waiters())
            .field("auto_reset", &self.core.auto_reset)
            .finish()
    }
}

/// Removal link from a subscriber (or its future) back to the waiter
/// queue; marks the slot so a concurrent re-attach is refused.
struct DetachLink<P: Clone + Send + 'static> {
    queue: Weak<WaitQueue<Waiter<P>>>,
    slot: Arc<Slot>,
}

impl<P: Clone + Send + 'static> Clone for DetachLink<P> {
    fn clone(&self) -> Self {
        Self {
            queue: Weak::clone(&self.queue),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<P: Clone + Send + 'static> DetachLink<P> {
    fn detach(&self) {
        if let Some(key) = self.slot.mark_cancelled() {
            if let Some(queue) = self.queue.upgrade() {
                drop(queue.remove(key));
            }
        }
    }
}

/// Future returned by [`Event::execute_async`].
#[must_use = "futures do nothing unless polled"]
pub struct EventExecuteAsync<P: Clone + Send + 'static, T> {
    shared: Arc<Completion<P>>,
    mapper: Option<Box<dyn FnOnce(P) -> Result<T> + Send>>,
    link: DetachLink<P>,
}

impl<P: Clone + Send + 'static, T> Future for EventExecuteAsync<P, T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shared.poll_take(cx) {
            Poll::Ready(Ok(payload)) => {
                let Some(mapper) = self.mapper.take() else {
                    return Poll::Ready(Err(Error::invalid_state(
                        "execute_async polled after completion",
                    )));
                };
                let result = match catch_unwind(AssertUnwindSafe(|| mapper(payload))) {
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

impl<P: Clone + Send + 'static, T> Drop for EventExecuteAsync<P, T> {
    fn drop(&mut self) {
        self.link.detach();
        self.shared.abandon();
    }
}

/// Future returned by [`Event::execute_background`].
#[must_use = "futures do nothing unless polled"]
pub struct EventExecuteBackground<P: Clone + Send + 'static, T> {
    shared: Arc<Completion<T>>,
    link: DetachLink<P>,
}

impl<P: Clone + Send + 'static, T> Future for EventExecuteBackground<P, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.poll_take(cx)
    }
}

impl<P: Clone + Send + 'static, T> Drop for EventExecuteBackground<P, T> {
    fn drop(&mut self) {
        self.link.detach();
        self.shared.abandon();
    }
}
