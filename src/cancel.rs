//! Cancellation tokens.
//!
//! Cancellation is a protocol, not a silent drop: a [`CancelToken`] carries
//! a shared flag plus a set of connected callbacks that fire exactly once
//! when the token is cancelled. Components connect a callback that removes
//! their queued record, so a cancellation signalled at any suspension point
//! surfaces as a `Cancelled` error to the waiting caller.
//!
//! A callback connected after the token has already been cancelled runs
//! immediately on the connecting thread. Callbacks always run outside the
//! token's internal lock, on the cancelling thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Identifier for a connected cancellation callback, used to disconnect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Callback invoked when a token is cancelled.
pub type CancelCallback = Box<dyn FnOnce() + Send>;

struct TokenInner {
    cancelled: AtomicBool,
    callbacks: Mutex<CallbackSlots>,
}

struct CallbackSlots {
    next_id: u64,
    entries: SmallVec<[(u64, CancelCallback); 2]>,
}

/// A cloneable cancellation token.
///
/// All clones share the same state; cancelling any clone cancels them all.
///
/// # Example
///
/// ```
/// use taskloom::cancel::CancelToken;
///
/// let token = CancelToken::new();
/// let id = token.connect(Box::new(|| {}));
/// assert!(!token.is_cancelled());
/// token.disconnect(id);
/// token.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(CallbackSlots {
                    next_id: 1,
                    entries: SmallVec::new(),
                }),
            }),
        }
    }

    /// Returns `true` if the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` if the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }

    /// Cancels the token, firing all connected callbacks exactly once.
    ///
    /// Later calls are no-ops. Callbacks run on the cancelling thread, in
    /// connection order, outside the token's lock.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: SmallVec<[(u64, CancelCallback); 2]> = {
            let mut slots = lock_slots(&self.inner);
            std::mem::take(&mut slots.entries)
        };
        for (_, callback) in drained {
            callback();
        }
    }

    /// Connects a callback to run when the token is cancelled.
    ///
    /// If the token is already cancelled, the callback runs immediately on
    /// the calling thread and the returned id refers to nothing.
    pub fn connect(&self, callback: CancelCallback) -> CallbackId {
        {
            let mut slots = lock_slots(&self.inner);
            if !self.is_cancelled() {
                let id = slots.next_id;
                slots.next_id += 1;
                slots.entries.push((id, callback));
                return CallbackId(id);
            }
        }
        callback();
        CallbackId(0)
    }

    /// Disconnects a previously connected callback.
    ///
    /// No-op if the callback has already fired or was never connected.
    pub fn disconnect(&self, id: CallbackId) {
        let mut slots = lock_slots(&self.inner);
        slots.entries.retain(|(entry_id, _)| *entry_id != id.0);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn lock_slots(inner: &TokenInner) -> std::sync::MutexGuard<'_, CallbackSlots> {
    match inner.callbacks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
