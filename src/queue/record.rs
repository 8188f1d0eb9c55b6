//! Task records: the unit a task queue enqueues and dispatches.
//!
//! A record bundles the payload (a callable returning "re-enqueue me?"),
//! the optional cancellation hookup, and a failure hook fired when the
//! record leaves the queue without ever running (cancelled or shut down).
//! A record lives in at most one queue at a time; requeueing reassigns its
//! age through the shared [`Slot`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::cancel::{CallbackId, CancelToken};
use crate::error::{Error, Result};
use crate::queue::wait_queue::Slot;

/// The payload: returns `Ok(true)` to be re-enqueued with a fresh age,
/// `Ok(false)` to be dropped after this dispatch.
pub(crate) type TaskPayload = Box<dyn FnMut() -> Result<bool> + Send>;

/// Hook fired when the record is removed without running.
pub(crate) type DropHook = Box<dyn FnOnce(Error) + Send>;

pub(crate) struct TaskRecord {
    payload: TaskPayload,
    on_drop: Option<DropHook>,
    slot: Arc<Slot>,
    cancel: Option<(CancelToken, CallbackId)>,
}

impl TaskRecord {
    pub(crate) fn new(payload: TaskPayload, slot: Arc<Slot>, on_drop: Option<DropHook>) -> Self {
        Self {
            payload,
            on_drop,
            slot,
            cancel: None,
        }
    }

    pub(crate) fn set_cancel(&mut self, token: CancelToken, id: CallbackId) {
        self.cancel = Some((token, id));
    }

    pub(crate) fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|(token, _)| token.is_cancelled())
    }

    /// Marks the record as out of the queue so a late cancel is a no-op.
    pub(crate) fn begin_dispatch(&self) {
        self.slot.begin_dispatch();
    }

    /// Runs the payload, converting a panic into `CallbackFailed`.
    pub(crate) fn execute(&mut self) -> Result<bool> {
        match catch_unwind(AssertUnwindSafe(|| (self.payload)())) {
            Ok(result) => result,
            Err(panic) => Err(Error::callback_panicked(panic.as_ref())),
        }
    }

    /// The record is leaving without having run: fire the failure hook so
    /// any waiting caller observes `err` instead of hanging.
    pub(crate) fn fail(mut self, err: Error) {
        if let Some(hook) = self.on_drop.take() {
            hook(err);
        }
    }
}

impl Drop for TaskRecord {
    fn drop(&mut self) {
        // Keep the token from holding a dead callback.
        if let Some((token, id)) = self.cancel.take() {
            token.disconnect(id);
        }
    }
}
