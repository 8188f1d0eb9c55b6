//! End-to-end ordering: priority beats FIFO, FIFO breaks ties, and a
//! re-enqueueing task keeps winning until it stops asking.

mod common;

use std::sync::{Arc, Mutex};

use taskloom::{TaskQueue, ThreadConfig, Wait};

#[test]
fn requeueing_high_priority_task_runs_to_completion_first() {
    common::init_test_logging();
    let queue = TaskQueue::with_config(ThreadConfig::external_only("order"));
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    for label in ["One", "Two", "Three"] {
        let log = Arc::clone(&log);
        queue
            .add(0, None, move || {
                log.lock().unwrap().push(label.to_string());
                Ok(false)
            })
            .unwrap();
    }

    // Higher priority (numerically smaller), re-enqueues itself until 8.
    let counter_log = Arc::clone(&log);
    let mut n = 0u32;
    queue
        .add(-1, None, move || {
            n += 1;
            counter_log.lock().unwrap().push(format!(":: {n}"));
            Ok(n < 8)
        })
        .unwrap();

    while queue.process(Wait::None) {}

    let expected: Vec<String> = (1..=8)
        .map(|n| format!(":: {n}"))
        .chain(["One", "Two", "Three"].map(String::from))
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);
}

#[test]
fn dispatch_order_is_sorted_by_priority_then_age() {
    common::init_test_logging();
    let queue = TaskQueue::with_config(ThreadConfig::external_only("sorted"));
    let log = Arc::new(Mutex::new(Vec::new()));

    let submissions = [(3, "c1"), (1, "a1"), (3, "c2"), (2, "b1"), (1, "a2")];
    for (priority, label) in submissions {
        let log = Arc::clone(&log);
        queue
            .add(priority, None, move || {
                log.lock().unwrap().push(label);
                Ok(false)
            })
            .unwrap();
    }

    while queue.process(Wait::None) {}
    assert_eq!(*log.lock().unwrap(), vec!["a1", "a2", "b1", "c1", "c2"]);
}
