//! A blocking pop on an empty queue wakes exactly when a software timer
//! pushes from interrupt context, with exactly two context switches
//! (current -> idle -> current).
use tern_kernel::{context_switch_count, tick_count, MessageQueueCb, ThreadCb, TimerCb};

static MAIN_THREAD: ThreadCb = ThreadCb::new_main(2);

static QUEUE: MessageQueueCb<u32, 1> = MessageQueueCb::new();

static PUSH_TIMER: TimerCb = TimerCb::new(push_from_interrupt, 0);

fn push_from_interrupt(_: usize) {
    QUEUE.try_push(0x93, 0x2f5b_e1a4).unwrap();
}

#[test]
fn timed_queue_pop() {
    tern_port_std::boot(&MAIN_THREAD);

    let ticks_before = tick_count();
    PUSH_TIMER.arm(ticks_before + 10, 0).unwrap();

    let switches_before = context_switch_count();
    let (priority, value) = QUEUE.pop().unwrap();

    assert_eq!(priority, 0x93);
    assert_eq!(value, 0x2f5b_e1a4);
    assert_eq!(tick_count() - ticks_before, 10);
    assert_eq!(context_switch_count() - switches_before, 2);
    assert!(!PUSH_TIMER.is_armed().unwrap());
}
