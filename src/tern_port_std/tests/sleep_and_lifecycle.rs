//! Sleeping, tick accounting, and thread lifecycle errors.
use tern_kernel::{
    signal, sleep_for, sleep_until, tick_count, Errno, SchedulingPolicy, SemaphoreCb,
    StackStorage, ThreadCb, ThreadState,
};
use std::sync::Mutex;

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(2);

static SLEEP_RESULT: Mutex<Option<Result<(), Errno>>> = Mutex::new(None);
static DONE: SemaphoreCb = SemaphoreCb::new(0, 1);

static SLEEPER_STACK: StackStorage<4096> = StackStorage::new();
static SLEEPER_THREAD: ThreadCb =
    ThreadCb::new(&SLEEPER_STACK, sleeper_body, 0, 1, SchedulingPolicy::Fifo);

fn sleeper_body(_: usize) {
    *SLEEP_RESULT.lock().unwrap() = Some(sleep_for(1_000_000));
    DONE.post().unwrap();
}

#[test]
fn sleep_and_lifecycle() {
    tern_port_std::boot(&MAIN_THREAD);

    // Sleeps last exactly the requested number of ticks
    let ticks_before = tick_count();
    sleep_for(5).unwrap();
    assert_eq!(tick_count() - ticks_before, 5);

    let now = tick_count();
    sleep_until(now + 3).unwrap();
    assert_eq!(tick_count(), now + 3);

    // A deadline in the past returns without blocking
    let now = tick_count();
    sleep_until(now).unwrap();
    sleep_until(now.saturating_sub(1)).unwrap();
    assert_eq!(tick_count(), now);

    // A thread cannot join itself, and joining a never-started thread is
    // invalid
    static UNSTARTED_STACK: StackStorage<4096> = StackStorage::new();
    static UNSTARTED: ThreadCb =
        ThreadCb::new(&UNSTARTED_STACK, unstarted_body, 0, 1, SchedulingPolicy::Fifo);
    fn unstarted_body(_: usize) {}
    assert_eq!(UNSTARTED.join(), Err(Errno::EINVAL));
    assert_eq!(MAIN_THREAD.join(), Err(Errno::EDEADLK));

    // A signal cuts a long sleep short with EINTR
    SLEEPER_THREAD.start().unwrap();
    sleep_for(1).unwrap();
    assert_eq!(SLEEPER_THREAD.state().unwrap(), ThreadState::BlockedOnSleep);
    signal::generate(&SLEEPER_THREAD, 0).unwrap();
    DONE.wait().unwrap();
    assert_eq!(*SLEEP_RESULT.lock().unwrap(), Some(Err(Errno::EINTR)));

    // The sleeper has exited; joining it now succeeds immediately, and a
    // detached thread refuses late joins
    SLEEPER_THREAD.join().unwrap();
    assert_eq!(SLEEPER_THREAD.state().unwrap(), ThreadState::Terminated);
    SLEEPER_THREAD.detach().unwrap();
    assert_eq!(SLEEPER_THREAD.join(), Err(Errno::EINVAL));

    // Restarting a terminated thread is rejected
    assert_eq!(SLEEPER_THREAD.start(), Err(Errno::EINVAL));
}
