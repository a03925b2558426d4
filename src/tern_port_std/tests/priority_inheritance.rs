//! Priority-inheritance chain: while a high-priority thread is blocked on a
//! mutex, the owner's effective priority is lifted to the waiter's, and it
//! returns to its base priority when the mutex changes hands.
use std::sync::Mutex;

use tern_kernel::{
    sleep_for, Errno, MutexCb, MutexKind, MutexProtocol, SchedulingPolicy, SemaphoreCb,
    StackStorage, ThreadCb, ThreadState,
};

static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn record(event: &'static str) {
    EVENTS.lock().unwrap().push(event);
}

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(2);

static M: MutexCb = MutexCb::new(MutexKind::NonRecursive, MutexProtocol::PriorityInheritance);

/// Gates the owner between acquiring and releasing the mutex.
static OWNER_GO: SemaphoreCb = SemaphoreCb::new(0, 1);

static OWNER_STACK: StackStorage<4096> = StackStorage::new();
static OWNER_THREAD: ThreadCb =
    ThreadCb::new(&OWNER_STACK, owner_body, 0, 1, SchedulingPolicy::Fifo);

static WAITER_STACK: StackStorage<4096> = StackStorage::new();
static WAITER_THREAD: ThreadCb =
    ThreadCb::new(&WAITER_STACK, waiter_body, 0, 3, SchedulingPolicy::Fifo);

fn owner_body(_: usize) {
    M.lock().unwrap();
    record("owner: locked");
    OWNER_GO.wait().unwrap();
    M.unlock().unwrap();
    record("owner: unlocked");
    let _ = OWNER_GO.wait(); // park
}

fn waiter_body(_: usize) {
    record("waiter: locking");
    M.lock().unwrap();
    record("waiter: locked");
    M.unlock().unwrap();
}

#[test]
fn priority_inheritance_chain() {
    tern_port_std::boot(&MAIN_THREAD);

    // Let the low-priority owner take the mutex
    OWNER_THREAD.start().unwrap();
    sleep_for(1).unwrap();
    assert_eq!(*EVENTS.lock().unwrap(), ["owner: locked"]);
    assert_eq!(OWNER_THREAD.effective_priority().unwrap(), 1);

    // The high-priority waiter preempts us immediately and blocks on the
    // mutex, lending its priority to the owner
    WAITER_THREAD.start().unwrap();
    assert_eq!(
        WAITER_THREAD.state().unwrap(),
        ThreadState::BlockedOnMutex
    );
    assert_eq!(OWNER_THREAD.priority().unwrap(), 1);
    assert_eq!(OWNER_THREAD.effective_priority().unwrap(), 3);

    // A boosted owner cannot be locked around: it now outranks us too
    assert_eq!(M.try_lock(), Err(Errno::EBUSY));

    // Release the owner; it hands the mutex to the waiter and drops back to
    // its base priority
    OWNER_GO.post().unwrap();
    sleep_for(1).unwrap();
    assert_eq!(OWNER_THREAD.effective_priority().unwrap(), 1);
    assert_eq!(WAITER_THREAD.state().unwrap(), ThreadState::Terminated);
    assert_eq!(
        *EVENTS.lock().unwrap(),
        [
            "owner: locked",
            "waiter: locking",
            "waiter: locked",
            "owner: unlocked",
        ],
    );
    assert!(!M.is_locked().unwrap());
}
