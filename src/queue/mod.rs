//! The task-dispatch substrate: ordered wait-queue, task records, worker
//! accounting, and the public [`TaskQueue`].

pub(crate) mod completion;
pub(crate) mod record;
pub mod task_queue;
pub(crate) mod wait_queue;
pub mod workers;

pub use task_queue::{
    default_queue, ExecuteAsync, ExecuteBackground, TaskQueue, PRIORITY_DEFAULT,
};
pub use wait_queue::Wait;
pub use workers::{ThreadConfig, DEFAULT_MAX_IDLE};
