//! Scope-bound claims: handles that release their underlying lock or
//! pooled resource on destruction.
//!
//! A claim is `active` from acquisition until its single release; the
//! destructor releases an active claim, including during unwinding. A
//! second release (or a release of a never-acquired claim) is a violation:
//! logged at error severity, then ignored.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tracing::error;

use crate::error::Result;
use crate::sync::pool::PoolCore;
use crate::sync::semaphore::{LockFuture, Semaphore};
use crate::time::Ticks;

/// A scope-bound claim on a [`Semaphore`]: acquired by `lock`, released by
/// `unlock`.
#[must_use = "a claim releases immediately if not held"]
pub struct SemaphoreClaim {
    sem: Semaphore,
    acquired: Ticks,
    released: Ticks,
}

impl SemaphoreClaim {
    /// Wraps a claim the semaphore has already granted.
    pub(crate) fn grant(sem: Semaphore) -> Self {
        let acquired = stamp(sem.clock().now(), Ticks::ZERO);
        Self {
            sem,
            acquired,
            released: Ticks::ZERO,
        }
    }

    /// `true` from acquisition until release.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.acquired.is_zero() && self.released.is_zero()
    }

    /// When the claim was acquired.
    #[must_use]
    pub fn acquired_ticks(&self) -> Ticks {
        self.acquired
    }

    /// When the claim was released; zero while still active.
    #[must_use]
    pub fn released_ticks(&self) -> Ticks {
        self.released
    }

    /// Releases the claim. A repeated release is logged and ignored.
    pub fn release(&mut self) {
        if !self.is_active() {
            error!("semaphore claim released twice or never acquired");
            return;
        }
        self.sem.unlock();
        self.released = stamp(self.sem.clock().now(), self.acquired);
    }
}

impl Drop for SemaphoreClaim {
    fn drop(&mut self) {
        if self.is_active() {
            self.release();
        }
    }
}

impl std::fmt::Debug for SemaphoreClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreClaim")
            .field("active", &self.is_active())
            .field("acquired", &self.acquired)
            .field("released", &self.released)
            .finish()
    }
}

/// Future returned by [`Semaphore::claim_async`].
#[must_use = "futures do nothing unless polled"]
pub struct SemaphoreClaimFuture {
    sem: Semaphore,
    lock: LockFuture,
}

impl SemaphoreClaimFuture {
    pub(crate) fn new(sem: Semaphore, lock: LockFuture) -> Self {
        Self { sem, lock }
    }
}

impl Future for SemaphoreClaimFuture {
    type Output = Result<SemaphoreClaim>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.lock).poll(cx)) {
            Ok(()) => Poll::Ready(Ok(SemaphoreClaim::grant(self.sem.clone()))),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

/// A scope-bound claim on a pooled resource: acquired by `acquire`,
/// released by `release`, exposing the resource for use.
#[must_use = "a claim releases immediately if not held"]
pub struct ResourceClaim<R: Send + Sync + 'static> {
    pool: Arc<PoolCore<R>>,
    resource: Option<Arc<R>>,
    acquired: Ticks,
    released: Ticks,
}

impl<R: Send + Sync + 'static> ResourceClaim<R> {
    pub(crate) fn grant(pool: Arc<PoolCore<R>>, resource: Arc<R>) -> Self {
        let acquired = stamp(pool.clock().now(), Ticks::ZERO);
        Self {
            pool,
            resource: Some(resource),
            acquired,
            released: Ticks::ZERO,
        }
    }

    /// The claimed resource.
    ///
    /// # Panics
    ///
    /// Panics if called after release.
    #[must_use]
    pub fn resource(&self) -> &R {
        self.resource
            .as_deref()
            .expect("resource claim already released")
    }

    /// `true` from acquisition until release.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.acquired.is_zero() && self.released.is_zero()
    }

    /// When the claim was acquired.
    #[must_use]
    pub fn acquired_ticks(&self) -> Ticks {
        self.acquired
    }

    /// When the claim was released; zero while still active.
    #[must_use]
    pub fn released_ticks(&self) -> Ticks {
        self.released
    }

    /// Returns the resource to the pool. A repeated release is logged and
    /// ignored.
    pub fn release(&mut self) {
        if !self.is_active() {
            error!("resource claim released twice or never acquired");
            return;
        }
        if let Some(resource) = self.resource.take() {
            PoolCore::release_resource(&self.pool, resource);
        }
        self.released = stamp(self.pool.clock().now(), self.acquired);
    }
}

impl<R: Send + Sync + 'static> Drop for ResourceClaim<R> {
    fn drop(&mut self) {
        if self.is_active() {
            self.release();
        }
    }
}

impl<R: Send + Sync + 'static> std::fmt::Debug for ResourceClaim<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClaim")
            .field("active", &self.is_active())
            .field("acquired", &self.acquired)
            .field("released", &self.released)
            .finish()
    }
}

/// A release stamp must land strictly after `floor`; a microsecond clock
/// can read the same tick twice within one call.
fn stamp(now: Ticks, floor: Ticks) -> Ticks {
    Ticks::from_micros(now.as_micros().max(floor.as_micros() + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::wait_queue::Wait;
    use crate::queue::workers::ThreadConfig;
    use std::time::Duration;

    fn semaphore() -> Semaphore {
        Semaphore::with_config(
            1,
            ThreadConfig {
                name: "claim-test".to_string(),
                max_threads: 2,
                max_idle: Wait::For(Duration::from_millis(50)),
            },
        )
    }

    #[test]
    fn claim_releases_on_drop() {
        let sem = semaphore();
        {
            let claim = sem.claim(0, None).unwrap();
            assert!(claim.is_active());
            assert_eq!(sem.claims(), 1);
        }
        assert_eq!(sem.claims(), 0);
        sem.shutdown();
    }

    #[test]
    fn consecutive_scoped_claims_do_not_deadlock() {
        let sem = semaphore();
        {
            let _claim = sem.claim(0, None).unwrap();
        }
        {
            let _claim = sem.claim(0, None).unwrap();
        }
        sem.shutdown();
    }

    #[test]
    fn release_is_single_shot_with_ordered_stamps() {
        let sem = semaphore();
        let mut claim = sem.claim(0, None).unwrap();
        claim.release();
        assert!(!claim.is_active());
        assert!(claim.released_ticks() > claim.acquired_ticks());
        let released_at = claim.released_ticks();

        // Second release: logged, ignored, stamps untouched.
        claim.release();
        assert_eq!(claim.released_ticks(), released_at);
        assert_eq!(sem.claims(), 0);
        sem.shutdown();
    }

    #[test]
    fn claim_async_grants_through_the_queue() {
        let sem = semaphore();
        let claim = crate::idle::IdleLoop::new()
            .block_on(sem.claim_async(0, None))
            .unwrap();
        assert!(claim.is_active());
        assert_eq!(sem.claims(), 1);
        drop(claim);
        assert_eq!(sem.claims(), 0);
        sem.shutdown();
    }
}
