//! Condition variables: wait releases the mutex atomically, notifications
//! wake in priority order, and a timed wait re-acquires the mutex even on
//! timeout.
use std::sync::atomic::{AtomicU32, Ordering};

use tern_kernel::{
    sleep_for, tick_count, CondVarCb, Errno, MutexCb, MutexKind, MutexProtocol,
    SchedulingPolicy, StackStorage, ThreadCb, ThreadState,
};

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(2);

static LOCK: MutexCb = MutexCb::new(MutexKind::NonRecursive, MutexProtocol::Normal);
static COND: CondVarCb = CondVarCb::new();
static GENERATION: AtomicU32 = AtomicU32::new(0);
static OBSERVED: AtomicU32 = AtomicU32::new(0);

static WAITER_STACK: StackStorage<4096> = StackStorage::new();
static WAITER_THREAD: ThreadCb =
    ThreadCb::new(&WAITER_STACK, waiter_body, 0, 1, SchedulingPolicy::Fifo);

fn waiter_body(_: usize) {
    LOCK.lock().unwrap();
    while GENERATION.load(Ordering::Relaxed) == 0 {
        COND.wait(&LOCK).unwrap();
    }
    OBSERVED.store(GENERATION.load(Ordering::Relaxed), Ordering::Relaxed);
    LOCK.unlock().unwrap();
}

#[test]
fn condition_variable() {
    tern_port_std::boot(&MAIN_THREAD);

    // Waiting requires holding the mutex
    assert_eq!(COND.wait(&LOCK), Err(Errno::EPERM));

    WAITER_THREAD.start().unwrap();
    sleep_for(1).unwrap();
    assert_eq!(
        WAITER_THREAD.state().unwrap(),
        ThreadState::BlockedOnCondition
    );
    // The waiter released the mutex while blocked
    assert!(!LOCK.is_locked().unwrap());

    // Publish under the mutex, then notify
    LOCK.lock().unwrap();
    GENERATION.store(7, Ordering::Relaxed);
    LOCK.unlock().unwrap();
    COND.notify_one().unwrap();
    sleep_for(1).unwrap();

    assert_eq!(OBSERVED.load(Ordering::Relaxed), 7);
    assert_eq!(WAITER_THREAD.state().unwrap(), ThreadState::Terminated);

    // A timed wait that expires still comes back owning the mutex
    LOCK.lock().unwrap();
    let ticks_before = tick_count();
    assert_eq!(COND.wait_for(&LOCK, 2), Err(Errno::ETIMEDOUT));
    assert_eq!(tick_count() - ticks_before, 2);
    assert!(LOCK.is_locked().unwrap());
    LOCK.unlock().unwrap();
}
