//! Taskloom: priority-ordered, cancellable task dispatch for event-loop
//! applications.
//!
//! # Overview
//!
//! Taskloom provides a task-dispatch substrate — an ordered, blocking
//! wait-queue driven by managed worker threads and, cooperatively, by the
//! caller's own idle loop — plus the coordination objects that share it:
//! semaphore, resource pool, lazy cell, event, and scope-bound claims.
//! Everything acquires through the same queue, so one set of rules holds
//! across the crate:
//!
//! - **Priority + FIFO**: lower numerical priority dispatches first; equal
//!   priorities dispatch in submission order.
//! - **Cancellation anywhere**: every blocking or suspending operation
//!   takes an optional [`CancelToken`]; a token fired before dispatch
//!   removes the work and surfaces `Cancelled`. A callback already running
//!   is never interrupted.
//! - **Thread/idle duality**: each operation comes in a blocking form, a
//!   cooperative `*_async` form resumed on the caller's host loop, and a
//!   `*_background` form that runs on a worker and resumes the caller.
//! - **Scope-bound release**: claims release their semaphore or pooled
//!   resource on drop, including during unwinding.
//!
//! # Host requirements
//!
//! The crate does not own an event loop. It needs a monotonic clock
//! ([`time::TimeSource`]) and an idle-dispatch hook
//! ([`idle::IdleScheduler`]); [`idle::IdleLoop`] is a self-contained host
//! good enough to drive the async forms without an external framework.
//!
//! # Module structure
//!
//! - [`queue`]: wait-queue, worker management, [`TaskQueue`]
//! - [`sync`]: [`Semaphore`], [`ResourcePool`], [`Lazy`], [`Event`], claims
//! - [`cancel`]: cancellation tokens
//! - [`idle`]: the host-loop contract and [`IdleLoop`]
//! - [`time`]: microsecond ticks, wall and virtual clocks
//! - [`error`]: the crate-wide error type
//!
//! # Example
//!
//! ```
//! use taskloom::{TaskQueue, ThreadConfig, Wait};
//!
//! // A queue driven entirely by the caller: no worker threads.
//! let queue = TaskQueue::with_config(ThreadConfig::external_only("demo"));
//! queue.add(0, None, || {
//!     println!("ran on the driving thread");
//!     Ok(false)
//! })?;
//! while queue.process(Wait::None) {}
//! # Ok::<(), taskloom::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod cancel;
pub mod error;
pub mod idle;
pub mod queue;
pub mod sync;
pub mod time;

pub use cancel::{CallbackId, CancelToken};
pub use error::{Error, ErrorKind, Result};
pub use idle::{IdleId, IdleLoop, IdleScheduler};
pub use queue::{
    default_queue, ExecuteAsync, ExecuteBackground, TaskQueue, ThreadConfig, Wait,
    DEFAULT_MAX_IDLE, PRIORITY_DEFAULT,
};
pub use sync::{
    Event, Lazy, PoolConfig, ResourceClaim, ResourcePool, Semaphore, SemaphoreClaim,
};
pub use time::{Ticks, TimeSource, VirtualClock, WallClock};
