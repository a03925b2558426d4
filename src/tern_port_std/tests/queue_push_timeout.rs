//! A timed push on a full queue fails with `ETIMEDOUT` exactly one tick
//! later, leaving the queue contents untouched.
use tern_kernel::{tick_count, Errno, FifoQueueCb, ThreadCb};

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(2);

static QUEUE: FifoQueueCb<u32, 1> = FifoQueueCb::new();

#[test]
fn queue_push_timeout() {
    tern_port_std::boot(&MAIN_THREAD);

    QUEUE.try_push(0xfeed).unwrap();
    assert_eq!(QUEUE.try_push(0xbeef), Err(Errno::EAGAIN));

    let ticks_before = tick_count();
    assert_eq!(QUEUE.try_push_for(0xbeef, 1), Err(Errno::ETIMEDOUT));
    assert_eq!(tick_count() - ticks_before, 1);

    // A zero timeout fails without blocking at all
    let ticks_before = tick_count();
    assert_eq!(QUEUE.try_push_for(0xbeef, 0), Err(Errno::ETIMEDOUT));
    assert_eq!(tick_count(), ticks_before);

    // The original element is still the only one stored
    assert_eq!(QUEUE.try_pop().unwrap(), 0xfeed);
    assert_eq!(QUEUE.try_pop(), Err(Errno::EAGAIN));
}
