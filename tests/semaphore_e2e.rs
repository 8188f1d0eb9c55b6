//! End-to-end semaphore scenarios: mutual exclusion, counting bounds, and
//! scope-bound claims.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use taskloom::{IdleLoop, Semaphore};

/// Tracks how many callbacks overlap and the worst case seen.
#[derive(Default)]
struct Overlap {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Overlap {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[test]
fn mutex_semantics_serialize_background_tasks() {
    common::init_test_logging();
    let sem = Semaphore::new(1);
    let overlap = Arc::new(Overlap::default());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let overlap = Arc::clone(&overlap);
            sem.execute_background(0, None, move || {
                overlap.enter();
                thread::sleep(Duration::from_millis(10));
                overlap.exit();
                Ok(())
            })
        })
        .collect();

    let idle = IdleLoop::new();
    for task in tasks {
        idle.block_on(task).unwrap();
    }
    assert_eq!(overlap.peak(), 1);
    assert_eq!(sem.claims(), 0);
    sem.shutdown();
}

#[test]
fn counting_semaphore_bounds_concurrency_to_eight() {
    common::init_test_logging();
    let sem = Semaphore::new(8);
    let overlap = Arc::new(Overlap::default());

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let overlap = Arc::clone(&overlap);
            let sleep_ms = rand::thread_rng().gen_range(1..=64);
            sem.execute_background(0, None, move || {
                overlap.enter();
                thread::sleep(Duration::from_millis(sleep_ms));
                overlap.exit();
                Ok(())
            })
        })
        .collect();

    let idle = IdleLoop::new();
    for task in tasks {
        idle.block_on(task).unwrap();
    }
    let peak = overlap.peak();
    assert!(peak >= 1, "nothing ever ran");
    assert!(peak <= 8, "claims exceeded the cap: {peak}");
    assert_eq!(sem.claims(), 0);
    sem.shutdown();
}

#[test]
fn consecutive_claim_scopes_do_not_deadlock() {
    common::init_test_logging();
    let sem = Semaphore::new(1);
    {
        let claim = sem.claim(0, None).unwrap();
        assert!(claim.is_active());
    }
    {
        // Deadlocks here if the first scope leaked its claim.
        let claim = sem.claim(0, None).unwrap();
        assert!(claim.is_active());
    }
    assert_eq!(sem.claims(), 0);
    sem.shutdown();
}

#[test]
fn blocking_lock_contends_fairly_across_threads() {
    common::init_test_logging();
    let sem = Arc::new(Semaphore::new(1));
    let overlap = Arc::new(Overlap::default());

    let holders: Vec<_> = (0..4)
        .map(|_| {
            let sem = Arc::clone(&sem);
            let overlap = Arc::clone(&overlap);
            thread::spawn(move || {
                for _ in 0..3 {
                    sem.lock(0, None).unwrap();
                    overlap.enter();
                    thread::sleep(Duration::from_millis(2));
                    overlap.exit();
                    sem.unlock();
                }
            })
        })
        .collect();
    for holder in holders {
        holder.join().unwrap();
    }
    assert_eq!(overlap.peak(), 1);
    assert_eq!(sem.claims(), 0);
    sem.shutdown();
}
