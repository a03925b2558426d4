//! A higher-priority thread runs before a lower-priority one, and the
//! lower-priority thread only gets the processor once its superior blocks
//! or exits.
use std::sync::Mutex;

use tern_kernel::{
    context_switch_count, sleep_for, tick_count, SchedulingPolicy, SemaphoreCb, StackStorage,
    ThreadCb, ThreadState,
};

static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn record(event: &'static str) {
    EVENTS.lock().unwrap().push(event);
}

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(4);

static LOW_STACK: StackStorage<4096> = StackStorage::new();
static LOW_THREAD: ThreadCb =
    ThreadCb::new(&LOW_STACK, low_body, 0, 1, SchedulingPolicy::Fifo);

static HIGH_STACK: StackStorage<4096> = StackStorage::new();
static HIGH_THREAD: ThreadCb =
    ThreadCb::new(&HIGH_STACK, high_body, 0, 2, SchedulingPolicy::Fifo);

/// Never posted; parks the low-priority thread once it has run.
static PARK: SemaphoreCb = SemaphoreCb::new(0, 1);

fn low_body(_: usize) {
    record("low: running");
    let _ = PARK.wait();
}

fn high_body(_: usize) {
    record("high: start");
    sleep_for(10).unwrap();
    record("high: exit");
}

#[test]
fn priority_preemption() {
    tern_port_std::boot(&MAIN_THREAD);

    let ticks_before = tick_count();
    let switches_before = context_switch_count();

    // Neither thread outranks the main thread, so nothing runs yet
    LOW_THREAD.start().unwrap();
    HIGH_THREAD.start().unwrap();
    assert_eq!(context_switch_count(), switches_before);
    assert!(EVENTS.lock().unwrap().is_empty());

    HIGH_THREAD.join().unwrap();

    // The high-priority thread ran first even though it was started second
    assert_eq!(
        *EVENTS.lock().unwrap(),
        ["high: start", "low: running", "high: exit"],
    );

    // high slept for exactly ten ticks, and nothing else advanced the clock
    assert_eq!(tick_count() - ticks_before, 10);

    // main -> high, high -> low (high sleeps), low -> idle (low parks),
    // idle -> high (sleep expires), high -> main (join completes)
    assert_eq!(context_switch_count() - switches_before, 5);

    assert_eq!(HIGH_THREAD.state().unwrap(), ThreadState::Terminated);
    assert_eq!(
        LOW_THREAD.state().unwrap(),
        ThreadState::BlockedOnSemaphore
    );
}
