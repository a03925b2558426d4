//! The Tern RTOS kernel core.
//!
//! A single-core, priority-preemptive kernel for small microcontrollers:
//! threads with FIFO or round-robin scheduling inside priority bands,
//! a software-timer supervisor driven by a monotonic tick, mutexes with
//! priority inheritance and priority protection, counting semaphores,
//! bounded FIFO/message queues, condition variables, and per-thread
//! signals.
//!
//! The kernel is a process-wide singleton. It never allocates: every
//! control block (threads, timers, mutexes, semaphores, queues) lives in
//! storage supplied by the caller, and registering one never copies it.
//! Architecture specifics - context-switch trampolines, interrupt masking,
//! the tick source - are reached exclusively through the [`Port`] function
//! table installed at boot by [`initialize`].
//!
//! # Contexts
//!
//! Blocking operations may only be called from thread context. Interrupt
//! handlers are restricted to the operations documented as interrupt-safe:
//! [`sched::unblock`], [`SemaphoreCb::post`], [`SemaphoreCb::try_wait`],
//! the queues' `try_*` forms, timer arming and disarming, signal
//! generation, and [`tick_interrupt_handler`]. A blocking call from
//! interrupt context halts a debug build through the port's fatal-error
//! hook and fails with `EPERM` otherwise.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)

pub mod condvar;
mod error;
mod klock;
mod list;
pub mod mutex;
mod port;
pub mod queue;
pub mod sched;
pub mod semaphore;
pub mod signal;
pub mod thread;
pub mod timer;
pub mod utils;

pub use crate::condvar::CondVarCb;
pub use crate::error::Errno;
pub use crate::mutex::{MutexCb, MutexKind, MutexProtocol};
pub use crate::port::{InterruptMask, Port};
pub use crate::queue::{
    FifoQueueCb, MessageQueueCb, RawFifoQueueCb, RawMessageQueueCb, RawQueueStorage,
};
pub use crate::sched::{
    context_switch_count, current_thread, initialize, resume, sleep_for, sleep_until, suspend,
    suspend_thread, switch_context, tick_count, tick_interrupt_handler, unblock, unblock_with,
    yield_now,
};
pub use crate::semaphore::SemaphoreCb;
pub use crate::signal::{NUM_SIGNALS, SignalSet};
pub use crate::thread::{
    exit, Priority, SchedulingPolicy, StackStorage, ThreadCb, ThreadState, UnblockReason,
    IDLE_PRIORITY, ROUND_ROBIN_QUANTUM,
};
pub use crate::timer::TimerCb;
