//! Suspending and resuming a thread is a round trip: the thread comes back
//! `Runnable` with the same priority, and a disarmed timer never fires.
use std::sync::atomic::{AtomicU32, Ordering};

use tern_kernel::{
    resume, sleep_for, suspend_thread, Errno, SchedulingPolicy, SemaphoreCb, StackStorage,
    ThreadCb, ThreadState, TimerCb,
};

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(2);

static RAN: AtomicU32 = AtomicU32::new(0);
static PARK: SemaphoreCb = SemaphoreCb::new(0, 1);

static WORKER_STACK: StackStorage<4096> = StackStorage::new();
static WORKER_THREAD: ThreadCb =
    ThreadCb::new(&WORKER_STACK, worker_body, 0, 1, SchedulingPolicy::Fifo);

fn worker_body(_: usize) {
    RAN.fetch_add(1, Ordering::Relaxed);
    let _ = PARK.wait();
}

static FIRED: AtomicU32 = AtomicU32::new(0);
static ONE_SHOT: TimerCb = TimerCb::new(on_fire, 0);

fn on_fire(_: usize) {
    FIRED.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn suspend_resume_round_trip() {
    tern_port_std::boot(&MAIN_THREAD);

    WORKER_THREAD.start().unwrap();
    assert_eq!(WORKER_THREAD.state().unwrap(), ThreadState::Runnable);

    // Suspend the worker before it ever runs
    suspend_thread(&WORKER_THREAD).unwrap();
    assert_eq!(WORKER_THREAD.state().unwrap(), ThreadState::Suspended);
    assert_eq!(suspend_thread(&WORKER_THREAD), Err(Errno::EINVAL));

    // While suspended, the worker gets no processor time
    sleep_for(3).unwrap();
    assert_eq!(RAN.load(Ordering::Relaxed), 0);

    resume(&WORKER_THREAD).unwrap();
    assert_eq!(WORKER_THREAD.state().unwrap(), ThreadState::Runnable);
    assert_eq!(WORKER_THREAD.priority().unwrap(), 1);
    assert_eq!(WORKER_THREAD.effective_priority().unwrap(), 1);
    assert_eq!(resume(&WORKER_THREAD), Err(Errno::EINVAL));

    // Once we block, the resumed worker runs
    sleep_for(1).unwrap();
    assert_eq!(RAN.load(Ordering::Relaxed), 1);
    assert_eq!(
        WORKER_THREAD.state().unwrap(),
        ThreadState::BlockedOnSemaphore
    );

    // arm then disarm is a no-op: the callback does not fire
    let now = tern_kernel::tick_count();
    ONE_SHOT.arm(now + 2, 0).unwrap();
    assert!(ONE_SHOT.is_armed().unwrap());
    ONE_SHOT.disarm().unwrap();
    assert!(!ONE_SHOT.is_armed().unwrap());
    sleep_for(5).unwrap();
    assert_eq!(FIRED.load(Ordering::Relaxed), 0);
}
