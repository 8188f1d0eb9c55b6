//! One-shot completion shared between a dispatched payload and the caller
//! waiting for its result.
//!
//! Supports both blocking waiters (`wait`) and polled futures
//! (`poll_take`). The producer side learns whether the value was actually
//! delivered: a `false` from [`Completion::complete`] means the consumer
//! abandoned the wait (dropped its future), letting the producer recover a
//! side effect such as an unobserved semaphore grant.

use std::sync::{Condvar, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};

enum State<T> {
    Pending { waker: Option<Waker> },
    Ready(Result<T>),
    Taken,
    Abandoned,
}

pub(crate) struct Completion<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending { waker: None }),
            done: Condvar::new(),
        }
    }

    /// Delivers the result, waking the waiter. Returns `false` if the
    /// consumer abandoned the completion; the value is dropped.
    pub(crate) fn complete(&self, value: Result<T>) -> bool {
        let waker = {
            let mut state = self.lock_state();
            match &mut *state {
                State::Pending { waker } => {
                    let waker = waker.take();
                    *state = State::Ready(value);
                    waker
                }
                State::Abandoned => return false,
                // A completion is single-producer; a second complete loses.
                State::Ready(_) | State::Taken => return true,
            }
        };
        self.done.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Blocks the calling thread until the result is delivered.
    pub(crate) fn wait(&self) -> Result<T> {
        let mut state = self.lock_state();
        loop {
            match std::mem::replace(&mut *state, State::Taken) {
                State::Ready(value) => return value,
                other @ State::Pending { .. } => {
                    *state = other;
                    state = match self.done.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                State::Taken | State::Abandoned => {
                    return Err(Error::invalid_state("completion consumed twice"));
                }
            }
        }
    }

    /// Future-side poll: registers the waker while pending, takes the
    /// result once ready.
    pub(crate) fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Ready(value) => Poll::Ready(value),
            State::Pending { .. } => {
                *state = State::Pending {
                    waker: Some(cx.waker().clone()),
                };
                Poll::Pending
            }
            State::Taken | State::Abandoned => {
                Poll::Ready(Err(Error::invalid_state("completion consumed twice")))
            }
        }
    }

    /// Consumer-side abandonment (a dropped future). Returns a result that
    /// was delivered but never observed, so the producer's side effect can
    /// be unwound by the caller.
    pub(crate) fn abandon(&self) -> Option<Result<T>> {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, State::Abandoned) {
            State::Ready(value) => {
                *state = State::Taken;
                Some(value)
            }
            _ => None,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_complete() {
        let completion = Arc::new(Completion::new());
        let producer = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                assert!(completion.complete(Ok(7)));
            })
        };
        assert_eq!(completion.wait().unwrap(), 7);
        producer.join().unwrap();
    }

    #[test]
    fn complete_after_abandon_reports_undelivered() {
        let completion: Completion<u32> = Completion::new();
        assert!(completion.abandon().is_none());
        assert!(!completion.complete(Ok(1)));
    }

    #[test]
    fn abandon_after_complete_returns_the_value() {
        let completion: Completion<u32> = Completion::new();
        assert!(completion.complete(Ok(9)));
        assert_eq!(completion.abandon().map(Result::unwrap), Some(9));
    }

    #[test]
    fn poll_take_registers_waker_then_takes() {
        let completion: Completion<&str> = Completion::new();
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(completion.poll_take(&mut cx).is_pending());
        completion.complete(Ok("done"));
        match completion.poll_take(&mut cx) {
            Poll::Ready(Ok(v)) => assert_eq!(v, "done"),
            other => panic!("unexpected poll result: {other:?}"),
        }
    }
}
