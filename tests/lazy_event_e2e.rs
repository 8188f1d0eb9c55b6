//! End-to-end lazy-initialization and event scenarios.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use taskloom::{Event, IdleLoop, Lazy};

#[test]
fn sixteen_threads_observe_one_initialization() {
    common::init_test_logging();
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&builds);
    let lazy = Lazy::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_secs(1));
        Ok(0xBEEF_u32)
    });

    let callers: Vec<_> = (0..16)
        .map(|_| {
            let lazy = lazy.clone();
            thread::spawn(move || {
                let value = lazy.get(0, None).unwrap();
                (std::ptr::from_ref(value) as usize, *value)
            })
        })
        .collect();

    let mut identities = Vec::new();
    for caller in callers {
        let (identity, value) = caller.join().unwrap();
        assert_eq!(value, 0xBEEF);
        identities.push(identity);
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1, "factory ran more than once");
    assert!(identities.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn two_async_waiters_complete_with_the_trigger_payload() {
    common::init_test_logging();
    let event: Event<String> = Event::new();

    let first = event.execute_async(0, None, |payload| Ok(format!("a:{payload}")));
    let second = event.execute_async(0, None, |payload| Ok(format!("b:{payload}")));
    event.trigger("Foo".to_string());

    let idle = IdleLoop::new();
    assert_eq!(idle.block_on(first).unwrap(), "a:Foo");
    assert_eq!(idle.block_on(second).unwrap(), "b:Foo");
    assert_eq!(event.num_waiters(), 0);
}

#[test]
fn background_mapper_runs_off_thread_and_returns_its_result() {
    common::init_test_logging();
    let event: Event<u32> = Event::new();
    let host = thread::current().id();

    let pending = event.execute_background(0, None, move |payload| {
        assert_ne!(thread::current().id(), host);
        Ok(payload * 2)
    });
    let trigger = {
        let event = event.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            event.trigger(21);
        })
    };
    let value = IdleLoop::new().block_on(pending).unwrap();
    assert_eq!(value, 42);
    trigger.join().unwrap();
}

#[test]
fn triggers_only_reach_waiters_attached_at_the_time() {
    common::init_test_logging();
    let event: Event<u32> = Event::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let observer = Arc::clone(&seen);
    event
        .add(0, None, move |payload| {
            observer.fetch_add(payload as usize, Ordering::SeqCst);
            true
        })
        .unwrap();

    event.trigger(1);
    event.trigger(10);
    assert_eq!(seen.load(Ordering::SeqCst), 11);

    // Attached after the triggers above: sees only the next one.
    let late = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&late);
    event
        .add(0, None, move |payload| {
            observer.fetch_add(payload as usize, Ordering::SeqCst);
            false
        })
        .unwrap();
    event.trigger(100);
    assert_eq!(late.load(Ordering::SeqCst), 100);
    assert_eq!(seen.load(Ordering::SeqCst), 111);
}
