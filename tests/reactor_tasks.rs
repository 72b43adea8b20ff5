use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spindle::executor::ThreadPerJobExecutor;
use spindle::Reactor;

#[test]
fn test_local_task_ordering() {
    let reactor = Reactor::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let push = |name: &'static str| {
        let log = log.clone();
        move || log.borrow_mut().push(name)
    };
    reactor.post(push("a"));
    reactor.post(push("b"));
    reactor.post_later(push("c"));
    reactor.post_later(push("d"));
    reactor.run();

    // post runs newest-first, post_later in submission order, and every
    // post runs before any post_later from the same tick.
    assert_eq!(*log.borrow(), vec!["b", "a", "c", "d"]);
}

#[test]
fn test_post_within_task_runs_same_tick() {
    let reactor = Reactor::new();
    let ticks = Rc::new(RefCell::new(Vec::new()));

    let inner_ticks = ticks.clone();
    let inner_reactor = reactor.clone();
    reactor.post(move || {
        let tick = inner_reactor.tick();
        inner_ticks.borrow_mut().push(tick);
        let nested_ticks = inner_ticks.clone();
        let nested_reactor = inner_reactor.clone();
        inner_reactor.post(move || {
            nested_ticks.borrow_mut().push(nested_reactor.tick());
        });
    });
    reactor.run();

    let ticks = ticks.borrow();
    assert_eq!(ticks.len(), 2);
    assert_eq!(ticks[0], ticks[1], "A nested post runs within the posting tick");
}

#[test]
fn test_run_returns_when_idle() {
    let reactor = Reactor::new();
    let start = Instant::now();
    reactor.run();
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "An empty reactor must not linger in the loop"
    );
}

#[test]
fn test_break_loop_overrides_keep_alive() {
    let reactor = Reactor::new();
    reactor.keep_alive(true);
    let breaker = reactor.clone();
    reactor.delay(Duration::from_millis(10), move || breaker.break_loop());
    let start = Instant::now();
    reactor.run();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_remote_post_wakes_sleeping_loop() {
    let reactor = Reactor::new();
    let remote = reactor.remote();
    assert!(remote.belongs_to(&reactor));

    let done = Arc::new(AtomicBool::new(false));
    let seen = done.clone();
    let guard = remote.start_operation();
    let poster = remote.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        poster.post(move || seen.store(true, Ordering::SeqCst));
        drop(guard);
    });

    let start = Instant::now();
    reactor.run();

    assert!(done.load(Ordering::SeqCst), "The concurrent task must have run");
    assert!(
        start.elapsed() >= Duration::from_millis(40),
        "The loop must stay alive while an operation is in flight"
    );
    handle.join().expect("Thread panicked");
    assert!(reactor.stats().concurrent_tasks() >= 1);
}

#[test]
fn test_operation_guard_completion_releases_loop() {
    let reactor = Reactor::new();
    let remote = reactor.remote();
    let guard = remote.start_operation();

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        guard.complete();
    });

    reactor.run();
    handle.join().expect("Thread panicked");
}

#[test]
fn test_run_blocking_round_trip() {
    let reactor = Reactor::new();
    let result = Rc::new(Cell::new(0u64));

    let sink = result.clone();
    reactor.run_blocking(
        &ThreadPerJobExecutor,
        || {
            thread::sleep(Duration::from_millis(20));
            21u64 * 2
        },
        move |value| sink.set(value),
    );
    reactor.run();

    assert_eq!(result.get(), 42, "The blocking result must reach the callback");
}

#[test]
fn test_reactor_current_inside_loop() {
    let reactor = Reactor::new();
    let matched = Rc::new(Cell::new(false));

    let seen = matched.clone();
    let expected = reactor.clone();
    reactor.post(move || {
        let current = Reactor::current().expect("Failed to resolve the current reactor");
        seen.set(Rc::ptr_eq(&current, &expected));
    });
    reactor.run();

    assert!(matched.get());
}
