//! Round-robin rotation: when a thread's quantum expires and an
//! equal-priority peer is runnable, the thread is rotated to the tail of
//! its band. The peers inject tick interrupts themselves, simulating ticks
//! that arrive while they are running.
use std::sync::Mutex;

use tern_kernel::{
    tick_interrupt_handler, yield_now, SchedulingPolicy, StackStorage, ThreadCb,
    ROUND_ROBIN_QUANTUM,
};

static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn record(event: &'static str) {
    EVENTS.lock().unwrap().push(event);
}

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(5);

const BURSTS: usize = 2;

static A_STACK: StackStorage<4096> = StackStorage::new();
static A_THREAD: ThreadCb =
    ThreadCb::new(&A_STACK, spinner, 0, 1, SchedulingPolicy::RoundRobin);

static B_STACK: StackStorage<4096> = StackStorage::new();
static B_THREAD: ThreadCb =
    ThreadCb::new(&B_STACK, spinner, 1, 1, SchedulingPolicy::RoundRobin);

/// Runs for `BURSTS` full quanta, reporting once per tick; every tick is
/// delivered while this thread is the running one.
fn spinner(id: usize) {
    let name = ["a", "b"][id];
    for _ in 0..BURSTS * ROUND_ROBIN_QUANTUM as usize {
        record(name);
        tick_interrupt_handler();
    }
}

#[test]
fn round_robin_rotation() {
    tern_port_std::boot(&MAIN_THREAD);

    A_THREAD.start().unwrap();
    B_THREAD.start().unwrap();
    A_THREAD.join().unwrap();
    B_THREAD.join().unwrap();

    // Each expiry hands the band over to the peer: a full quantum of "a",
    // then a full quantum of "b", repeated
    let events = EVENTS.lock().unwrap();
    let quantum = ROUND_ROBIN_QUANTUM as usize;
    assert_eq!(events.len(), 2 * BURSTS * quantum);
    for (i, chunk) in events.chunks(quantum).enumerate() {
        let expected = if i % 2 == 0 { "a" } else { "b" };
        assert!(
            chunk.iter().all(|&event| event == expected),
            "chunk {i} was {chunk:?}",
        );
    }
    drop(events);

    // An explicit yield is a no-op when the caller is alone in its band
    yield_now().unwrap();
}
