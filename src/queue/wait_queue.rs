//! Priority wait-queue: an ordered, blocking multi-consumer queue.
//!
//! Entries are totally ordered by `(priority, age)` ascending; lower
//! numerical priority wins and `age` (the enqueue sequence stamp) breaks
//! ties FIFO. Consumers block on one condition variable with a monotonic
//! deadline; spurious wakeups re-check the dispatch condition under the
//! queue mutex.
//!
//! A queue built with a claim gate additionally withholds entries while all
//! claims are held: `poll_timed` only returns an entry when `held < max`,
//! atomically incrementing `held` with the removal. This is the substrate
//! the semaphore builds on.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::cancel::{CallbackId, CancelToken};

/// How long an operation may wait for a dispatchable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until an entry is available (or the queue closes).
    Forever,
    /// Do not block; check once and return.
    None,
    /// Wait at most this long, measured against monotonic time.
    For(Duration),
}

impl Wait {
    /// Converts the source's signed-microseconds convention: negative means
    /// forever, zero means non-blocking, positive bounds the wait.
    #[must_use]
    pub fn from_micros(micros: i64) -> Self {
        match micros {
            m if m < 0 => Self::Forever,
            0 => Self::None,
            m => Self::For(Duration::from_micros(m as u64)),
        }
    }

    fn deadline(self) -> Option<Instant> {
        match self {
            Self::Forever => None,
            Self::None => Some(Instant::now()),
            Self::For(d) => Some(Instant::now() + d),
        }
    }
}

/// Total order of queue entries: ascending priority, then ascending age.
///
/// Ages are assigned from a per-queue counter at enqueue, so no two entries
/// in the same queue ever share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct OrderKey {
    /// Lower numerical value dispatches first.
    pub priority: i32,
    /// Enqueue sequence stamp; FIFO tie-breaker within a priority.
    pub age: u64,
}

/// Result of a successful `offer`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Offered {
    pub key: OrderKey,
    /// `true` when no consumer was blocked at insert time, i.e. the entry
    /// will sit until someone polls. Owners use this to spawn workers.
    pub consumer_shortage: bool,
}

/// An offer refused because the queue is closed; hands the value back so
/// the owner can fail its completion instead of dropping it silently.
pub(crate) struct Rejected<T>(pub T);

impl<T> std::fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rejected(..)")
    }
}

struct ClaimGate {
    max: usize,
    held: usize,
}

struct QueueInner<T> {
    entries: BTreeMap<OrderKey, T>,
    next_age: u64,
    waiting: usize,
    closed: bool,
    gate: Option<ClaimGate>,
}

/// The ordered blocking queue. One mutex, one condition variable.
pub(crate) struct WaitQueue<T> {
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
}

impl<T> WaitQueue<T> {
    pub(crate) fn new() -> Self {
        Self::build(None)
    }

    /// A queue whose dispatch is additionally gated by a claim counter.
    pub(crate) fn with_gate(max_claims: usize) -> Self {
        Self::build(Some(ClaimGate {
            max: max_claims,
            held: 0,
        }))
    }

    fn build(gate: Option<ClaimGate>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: BTreeMap::new(),
                next_age: 0,
                waiting: 0,
                closed: false,
                gate,
            }),
            available: Condvar::new(),
        }
    }

    /// Inserts an entry, assigning its age, and signals one waiter.
    ///
    /// Fails once the queue is closed, returning the value to the caller;
    /// entries are never silently dropped.
    pub(crate) fn offer(&self, priority: i32, value: T) -> std::result::Result<Offered, Rejected<T>> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(Rejected(value));
        }
        inner.next_age += 1;
        let key = OrderKey {
            priority,
            age: inner.next_age,
        };
        inner.entries.insert(key, value);
        let consumer_shortage = inner.waiting == 0;
        drop(inner);
        self.available.notify_one();
        Ok(Offered {
            key,
            consumer_shortage,
        })
    }

    /// Removes and returns the minimum `(priority, age)` entry, waiting up
    /// to `wait` for one to become dispatchable.
    ///
    /// On a gated queue this atomically takes a claim with the entry.
    /// Returns `None` on timeout, on an empty non-blocking check, or once
    /// the queue is closed.
    pub(crate) fn poll_timed(&self, wait: Wait) -> Option<(OrderKey, T)> {
        let deadline = wait.deadline();
        let mut inner = self.lock_inner();
        loop {
            if inner.closed {
                return None;
            }
            let gate_open = inner.gate.as_ref().map_or(true, |g| g.held < g.max);
            if gate_open {
                if let Some((key, value)) = inner.entries.pop_first() {
                    if let Some(gate) = inner.gate.as_mut() {
                        gate.held += 1;
                    }
                    return Some((key, value));
                }
            }
            inner = match self.park(inner, deadline) {
                Some(guard) => guard,
                None => return None,
            };
        }
    }

    /// Returns the key of the minimum entry without removing it, waiting up
    /// to `wait`. The claim gate is not consulted: peek reports presence.
    pub(crate) fn peek_timed(&self, wait: Wait) -> Option<OrderKey> {
        let deadline = wait.deadline();
        let mut inner = self.lock_inner();
        loop {
            if inner.closed {
                return None;
            }
            if let Some((&key, _)) = inner.entries.iter().next() {
                return Some(key);
            }
            inner = match self.park(inner, deadline) {
                Some(guard) => guard,
                None => return None,
            };
        }
    }

    /// Removes a specific entry. Used by cancellation.
    pub(crate) fn remove(&self, key: OrderKey) -> Option<T> {
        let mut inner = self.lock_inner();
        inner.entries.remove(&key)
    }

    /// Number of queued entries.
    pub(crate) fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    /// Number of consumers currently blocked in `poll_timed`/`peek_timed`.
    pub(crate) fn waiting_consumers(&self) -> usize {
        self.lock_inner().waiting
    }

    /// How many entries could be dispatched right now: the queue length,
    /// bounded by remaining claim capacity on a gated queue.
    pub(crate) fn demand(&self) -> usize {
        let inner = self.lock_inner();
        let len = inner.entries.len();
        match inner.gate.as_ref() {
            Some(gate) => len.min(gate.max.saturating_sub(gate.held)),
            None => len,
        }
    }

    /// Takes a claim immediately if one is available, bypassing the queue.
    pub(crate) fn try_claim(&self) -> bool {
        let mut inner = self.lock_inner();
        match inner.gate.as_mut() {
            Some(gate) if gate.held < gate.max => {
                gate.held += 1;
                true
            }
            _ => false,
        }
    }

    /// Returns a claim, signalling one blocked consumer.
    ///
    /// Returns `false` when no claim is held (caller logs the violation).
    pub(crate) fn release_claim(&self) -> bool {
        let mut inner = self.lock_inner();
        match inner.gate.as_mut() {
            Some(gate) if gate.held > 0 => {
                gate.held -= 1;
                drop(inner);
                self.available.notify_one();
                true
            }
            _ => false,
        }
    }

    /// `(held, max)` of the claim gate, if this queue has one.
    pub(crate) fn gate_stats(&self) -> Option<(usize, usize)> {
        let inner = self.lock_inner();
        inner.gate.as_ref().map(|g| (g.held, g.max))
    }

    /// Closes the queue, waking all consumers, and returns the entries that
    /// were still pending in dispatch order.
    pub(crate) fn close(&self) -> Vec<T> {
        let drained = {
            let mut inner = self.lock_inner();
            inner.closed = true;
            std::mem::take(&mut inner.entries)
                .into_values()
                .collect::<Vec<_>>()
        };
        self.available.notify_all();
        drained
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }

    /// Blocks on the condition variable until signalled or `deadline`.
    /// Returns `None` when the deadline has been reached.
    fn park<'a>(
        &'a self,
        mut inner: MutexGuard<'a, QueueInner<T>>,
        deadline: Option<Instant>,
    ) -> Option<MutexGuard<'a, QueueInner<T>>> {
        inner.waiting += 1;
        let mut guard = match deadline {
            None => {
                let guard = recover(self.available.wait(inner));
                Some(guard)
            }
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    inner.waiting -= 1;
                    return None;
                }
                let guard = recover_timeout(self.available.wait_timeout(inner, d - now));
                Some(guard)
            }
        }?;
        guard.waiting -= 1;
        Some(guard)
    }

    fn lock_inner(&self) -> MutexGuard<'_, QueueInner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Send + 'static> WaitQueue<T> {
    /// Connects a cancellation callback that removes the slot's entry from
    /// this queue and hands it to `on_cancelled`.
    ///
    /// Lock order is slot, then queue; `Slot::offer_link` takes them in the
    /// same order, so a cancel racing an offer resolves to exactly one of
    /// "never enqueued" or "removed".
    pub(crate) fn attach_cancel<F>(
        queue: &Arc<Self>,
        token: &CancelToken,
        slot: &Arc<Slot>,
        on_cancelled: F,
    ) -> CallbackId
    where
        F: FnOnce(T) + Send + 'static,
    {
        let queue = Arc::downgrade(queue);
        let slot = Arc::clone(slot);
        token.connect(Box::new(move || {
            let key = slot.mark_cancelled();
            if let Some(key) = key {
                if let Some(queue) = queue.upgrade() {
                    if let Some(value) = queue.remove(key) {
                        on_cancelled(value);
                    }
                }
            }
        }))
    }
}

fn recover<T>(result: std::sync::LockResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn recover_timeout<T>(
    result: std::result::Result<(T, std::sync::WaitTimeoutResult), std::sync::PoisonError<(T, std::sync::WaitTimeoutResult)>>,
) -> T {
    match result {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

/// Where a queued entry currently is, from the point of view of its
/// cancellation link and its owner's requeue logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Created but not yet offered.
    Pending,
    /// Sitting in the queue under this key.
    Queued(OrderKey),
    /// Taken out for dispatch, removed, or finished.
    Detached,
    /// Cancelled before the offer happened; must not be enqueued.
    CancelledEarly,
}

/// Outcome of [`Slot::offer_link`].
pub(crate) enum OfferOutcome<T> {
    /// Enqueued under the contained key.
    Queued(Offered),
    /// The slot was cancelled before the offer; the value was not enqueued.
    CancelledEarly(T),
    /// The queue is closed; the value was not enqueued.
    Closed(T),
}

/// Shared link between a queued entry, its cancellation callback, and its
/// owner. The entry's key changes on requeue (ages are fresh), so the link
/// holds the current key rather than the callback capturing a stale one.
pub(crate) struct Slot {
    state: parking_lot::Mutex<SlotState>,
}

impl Slot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::Mutex::new(SlotState::Pending),
        })
    }

    /// Offers `value` into `queue` and records the assigned key, all under
    /// the slot lock so a concurrent cancel cannot fall between.
    pub(crate) fn offer_link<T>(
        &self,
        queue: &WaitQueue<T>,
        priority: i32,
        value: T,
    ) -> OfferOutcome<T> {
        let mut state = self.state.lock();
        if *state == SlotState::CancelledEarly {
            return OfferOutcome::CancelledEarly(value);
        }
        match queue.offer(priority, value) {
            Ok(offered) => {
                *state = SlotState::Queued(offered.key);
                OfferOutcome::Queued(offered)
            }
            Err(Rejected(value)) => OfferOutcome::Closed(value),
        }
    }

    /// Marks the entry as taken for dispatch so a late cancel is a no-op.
    pub(crate) fn begin_dispatch(&self) {
        *self.state.lock() = SlotState::Detached;
    }

    /// Cancel-side transition: returns the key to remove, if the entry is
    /// currently queued; marks an un-offered slot as cancelled-early so a
    /// later offer through this slot is refused.
    pub(crate) fn mark_cancelled(&self) -> Option<OrderKey> {
        let mut state = self.state.lock();
        match *state {
            SlotState::Queued(key) => {
                *state = SlotState::Detached;
                Some(key)
            }
            SlotState::Pending => {
                *state = SlotState::CancelledEarly;
                None
            }
            _ => None,
        }
    }

    /// Caller-side removal (e.g. a dropped future): returns the key to
    /// remove if still queued.
    pub(crate) fn take_queued(&self) -> Option<OrderKey> {
        let mut state = self.state.lock();
        match *state {
            SlotState::Queued(key) => {
                *state = SlotState::Detached;
                Some(key)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn poll_returns_priority_then_fifo_order() {
        let queue = WaitQueue::new();
        queue.offer(5, "b1").unwrap();
        queue.offer(5, "b2").unwrap();
        queue.offer(1, "a").unwrap();
        queue.offer(9, "c").unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.poll_timed(Wait::None))
            .map(|(_, v)| v)
            .collect();
        assert_eq!(order, vec!["a", "b1", "b2", "c"]);
    }

    #[test]
    fn ages_are_unique_and_monotonic() {
        let queue = WaitQueue::new();
        let a = queue.offer(0, ()).unwrap().key;
        let b = queue.offer(0, ()).unwrap().key;
        assert!(b.age > a.age);
    }

    #[test]
    fn non_blocking_poll_on_empty_returns_none() {
        let queue: WaitQueue<()> = WaitQueue::new();
        assert!(queue.poll_timed(Wait::None).is_none());
        assert!(queue.peek_timed(Wait::None).is_none());
    }

    #[test]
    fn timed_poll_times_out() {
        let queue: WaitQueue<()> = WaitQueue::new();
        let start = Instant::now();
        let polled = queue.poll_timed(Wait::For(Duration::from_millis(20)));
        assert!(polled.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn offer_wakes_a_blocked_consumer() {
        let queue = Arc::new(WaitQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.poll_timed(Wait::For(Duration::from_secs(5))))
        };
        while queue.waiting_consumers() == 0 {
            thread::yield_now();
        }
        let offered = queue.offer(0, 42).unwrap();
        assert!(!offered.consumer_shortage);
        let polled = consumer.join().unwrap();
        assert_eq!(polled.map(|(_, v)| v), Some(42));
    }

    #[test]
    fn consumer_shortage_reported_when_nobody_waits() {
        let queue = WaitQueue::new();
        assert!(queue.offer(0, ()).unwrap().consumer_shortage);
    }

    #[test]
    fn remove_takes_out_a_specific_entry() {
        let queue = WaitQueue::new();
        let offered = queue.offer(3, "mid").unwrap();
        queue.offer(1, "low").unwrap();
        assert_eq!(queue.remove(offered.key), Some("mid"));
        assert_eq!(queue.remove(offered.key), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn gate_withholds_entries_until_release() {
        let queue = WaitQueue::with_gate(1);
        queue.offer(0, "first").unwrap();
        queue.offer(0, "second").unwrap();

        assert_eq!(queue.poll_timed(Wait::None).map(|(_, v)| v), Some("first"));
        assert_eq!(queue.gate_stats(), Some((1, 1)));
        assert_eq!(queue.demand(), 0);
        assert!(queue.poll_timed(Wait::None).is_none());

        assert!(queue.release_claim());
        assert_eq!(queue.poll_timed(Wait::None).map(|(_, v)| v), Some("second"));
    }

    #[test]
    fn release_without_claim_reports_false() {
        let queue: WaitQueue<()> = WaitQueue::with_gate(1);
        assert!(!queue.release_claim());
        let ungated: WaitQueue<()> = WaitQueue::new();
        assert!(!ungated.release_claim());
    }

    #[test]
    fn try_claim_barges_past_the_queue() {
        let queue: WaitQueue<()> = WaitQueue::with_gate(2);
        assert!(queue.try_claim());
        assert!(queue.try_claim());
        assert!(!queue.try_claim());
    }

    #[test]
    fn close_drains_in_order_and_rejects_offers() {
        let queue = WaitQueue::new();
        queue.offer(2, "b").unwrap();
        queue.offer(1, "a").unwrap();
        let drained = queue.close();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(queue.offer(0, "late").is_err());
        assert!(queue.poll_timed(Wait::Forever).is_none());
    }

    #[test]
    fn cancel_link_removes_queued_entry() {
        let queue = Arc::new(WaitQueue::new());
        let token = CancelToken::new();
        let slot = Slot::new();
        let removed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = Arc::clone(&removed);
        WaitQueue::attach_cancel(&queue, &token, &slot, move |_value: &str| {
            seen.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(matches!(
            slot.offer_link(&queue, 0, "entry"),
            OfferOutcome::Queued(_)
        ));

        token.cancel();
        assert!(removed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn cancel_before_offer_suppresses_enqueue() {
        let queue: Arc<WaitQueue<&str>> = Arc::new(WaitQueue::new());
        let token = CancelToken::new();
        let slot = Slot::new();
        WaitQueue::attach_cancel(&queue, &token, &slot, |_value| {});
        token.cancel();
        assert!(matches!(
            slot.offer_link(&queue, 0, "entry"),
            OfferOutcome::CancelledEarly(_)
        ));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn wait_from_micros_convention() {
        assert_eq!(Wait::from_micros(-1), Wait::Forever);
        assert_eq!(Wait::from_micros(0), Wait::None);
        assert_eq!(Wait::from_micros(250), Wait::For(Duration::from_micros(250)));
    }
}
