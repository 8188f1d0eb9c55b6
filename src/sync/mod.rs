//! Coordination objects built on the task-dispatch substrate: semaphore,
//! scoped claims, resource pool, lazy cell, and event.

pub mod claim;
pub mod event;
pub mod lazy;
pub mod pool;
pub mod semaphore;

pub use claim::{ResourceClaim, SemaphoreClaim, SemaphoreClaimFuture};
pub use event::{Event, EventExecuteAsync, EventExecuteBackground};
pub use lazy::{Lazy, LazyGet, LazyGetBackground};
pub use pool::{
    PoolAcquireFuture, PoolClaimFuture, PoolConfig, PoolExecuteAsync, PoolFactory, ResourcePool,
    TryAcquireError,
};
pub use semaphore::{LockFuture, Semaphore, SemaphoreExecuteAsync, TryLockError};
