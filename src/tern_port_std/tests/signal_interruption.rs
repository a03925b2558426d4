//! Generating a signal for a thread blocked on a semaphore releases it with
//! `EINTR`, leaving the semaphore value untouched.
use std::sync::Mutex;

use tern_kernel::{
    signal, sleep_for, Errno, SchedulingPolicy, SemaphoreCb, StackStorage, ThreadCb, ThreadState,
};

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(2);

static SEM: SemaphoreCb = SemaphoreCb::new(0, 1);
static DONE: SemaphoreCb = SemaphoreCb::new(0, 1);

static WAIT_RESULT: Mutex<Option<Result<(), Errno>>> = Mutex::new(None);

static TARGET_STACK: StackStorage<4096> = StackStorage::new();
static TARGET_THREAD: ThreadCb =
    ThreadCb::new(&TARGET_STACK, target_body, 0, 1, SchedulingPolicy::Fifo);

fn target_body(_: usize) {
    let result = SEM.wait();
    *WAIT_RESULT.lock().unwrap() = Some(result);
    DONE.post().unwrap();
}

#[test]
fn signal_interrupts_semaphore_wait() {
    tern_port_std::boot(&MAIN_THREAD);

    TARGET_THREAD.start().unwrap();
    sleep_for(1).unwrap(); // let the lower-priority target block
    assert_eq!(
        TARGET_THREAD.state().unwrap(),
        ThreadState::BlockedOnSemaphore
    );

    signal::generate(&TARGET_THREAD, 5).unwrap();
    DONE.wait().unwrap();

    assert_eq!(*WAIT_RESULT.lock().unwrap(), Some(Err(Errno::EINTR)));
    assert_eq!(SEM.value().unwrap(), 0);

    // The signal stays pending until accepted, and accepting is
    // edge-triggered
    assert_eq!(signal::pending_of(&TARGET_THREAD).unwrap(), 1 << 5);

    // Bad signal numbers are rejected outright
    assert_eq!(
        signal::generate(&TARGET_THREAD, 32),
        Err(Errno::EINVAL)
    );
}
