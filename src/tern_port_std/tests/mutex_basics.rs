//! Mutex contract checks: deadlock detection, recursion, ceiling protocol,
//! ownership errors, timed locking, and abandonment.
use tern_kernel::{
    sleep_for, tick_count, Errno, MutexCb, MutexKind, MutexProtocol, SchedulingPolicy,
    SemaphoreCb, StackStorage, ThreadCb, ThreadState,
};

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(2);

static PLAIN: MutexCb = MutexCb::new(MutexKind::NonRecursive, MutexProtocol::Normal);
static RECURSIVE: MutexCb = MutexCb::new(MutexKind::Recursive, MutexProtocol::Normal);
static CEILING: MutexCb = MutexCb::new(MutexKind::NonRecursive, MutexProtocol::PriorityProtect(5));
static LOW_CEILING: MutexCb =
    MutexCb::new(MutexKind::NonRecursive, MutexProtocol::PriorityProtect(1));
static ABANDONED: MutexCb = MutexCb::new(MutexKind::NonRecursive, MutexProtocol::Normal);
static HELD: MutexCb = MutexCb::new(MutexKind::NonRecursive, MutexProtocol::Normal);

static HOLDER_GO: SemaphoreCb = SemaphoreCb::new(0, 1);

static DOOMED_STACK: StackStorage<4096> = StackStorage::new();
static DOOMED_THREAD: ThreadCb =
    ThreadCb::new(&DOOMED_STACK, doomed_body, 0, 1, SchedulingPolicy::Fifo);

/// Exits while holding a mutex.
fn doomed_body(_: usize) {
    ABANDONED.lock().unwrap();
}

static HOLDER_STACK: StackStorage<4096> = StackStorage::new();
static HOLDER_THREAD: ThreadCb =
    ThreadCb::new(&HOLDER_STACK, holder_body, 0, 1, SchedulingPolicy::Fifo);

/// Holds a mutex until released.
fn holder_body(_: usize) {
    HELD.lock().unwrap();
    HOLDER_GO.wait().unwrap();
    HELD.unlock().unwrap();
    let _ = HOLDER_GO.wait(); // park
}

#[test]
fn mutex_basics() {
    tern_port_std::boot(&MAIN_THREAD);

    // Relocking a non-recursive mutex deadlocks; unlocking a mutex we don't
    // own is a permission error
    PLAIN.lock().unwrap();
    assert_eq!(PLAIN.lock(), Err(Errno::EDEADLK));
    PLAIN.unlock().unwrap();
    assert_eq!(PLAIN.unlock(), Err(Errno::EPERM));

    // Recursion counts lock depth
    RECURSIVE.lock().unwrap();
    RECURSIVE.lock().unwrap();
    RECURSIVE.unlock().unwrap();
    assert!(RECURSIVE.is_locked().unwrap());
    RECURSIVE.unlock().unwrap();
    assert!(!RECURSIVE.is_locked().unwrap());

    // The ceiling protocol raises the owner's effective priority for the
    // duration of the lock
    CEILING.lock().unwrap();
    assert_eq!(tern_kernel::current_thread().unwrap().effective_priority().unwrap(), 5);
    CEILING.unlock().unwrap();
    assert_eq!(tern_kernel::current_thread().unwrap().effective_priority().unwrap(), 2);

    // A thread whose base priority exceeds the ceiling may not lock
    assert_eq!(LOW_CEILING.lock(), Err(Errno::EINVAL));

    // Contention: try_lock fails fast, the timed form times out
    HOLDER_THREAD.start().unwrap();
    sleep_for(1).unwrap(); // let the holder take the lock
    assert!(HELD.is_locked().unwrap());
    assert_eq!(HELD.try_lock(), Err(Errno::EBUSY));
    let ticks_before = tick_count();
    assert_eq!(HELD.try_lock_for(2), Err(Errno::ETIMEDOUT));
    assert_eq!(tick_count() - ticks_before, 2);
    HOLDER_GO.post().unwrap();
    sleep_for(1).unwrap();
    assert!(!HELD.is_locked().unwrap());

    // A mutex abandoned by a dead owner reports EOWNERDEAD exactly once
    DOOMED_THREAD.start().unwrap();
    sleep_for(1).unwrap();
    assert_eq!(DOOMED_THREAD.state().unwrap(), ThreadState::Terminated);
    assert_eq!(ABANDONED.lock(), Err(Errno::EOWNERDEAD));
    // The lock was still acquired; hand it back and take it cleanly
    ABANDONED.unlock().unwrap();
    ABANDONED.lock().unwrap();
    ABANDONED.unlock().unwrap();
}
