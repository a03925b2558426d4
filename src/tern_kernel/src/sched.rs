//! The scheduler: run queue, suspended queue, block/unblock protocol, tick
//! handling, and the context-switch decision.
//!
//! All state lives in a single process-wide [`KernelState`], mutated only
//! inside the critical section. The running thread is always a member of the
//! runnable list; a context switch is required exactly when the head of that
//! list is a different thread.
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Errno;
use crate::klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut};
use crate::list::ThreadList;
use crate::mutex;
use crate::port::{self, Port};
use crate::thread::{
    self, thread_start, Priority, SchedulingPolicy, ThreadCb, ThreadState, UnblockFunctor,
    UnblockReason, IDLE_PRIORITY, ROUND_ROBIN_QUANTUM,
};
use crate::timer::{self, TimerList};
use crate::utils::Init;

/// Kernel-global state.
pub(crate) struct KernelState {
    /// Threads eligible to run, including the running one, keyed by
    /// (priority desc, insertion order). The head is the running thread
    /// unless a context switch is pending.
    pub(crate) runnable: ThreadList,
    pub(crate) suspended: ThreadList,
    pub(crate) sleeping: ThreadList,
    pub(crate) current: CpuLockCell<Option<&'static ThreadCb>>,
    /// Monotonic tick counter, incremented by exactly one per tick
    /// interrupt. Never wraps in practical time.
    pub(crate) tick_count: CpuLockCell<u64>,
    /// Armed software timers, sorted by deadline ascending.
    pub(crate) timers: TimerList,
}

static STATE: KernelState = KernelState {
    runnable: ThreadList::new(),
    suspended: ThreadList::new(),
    sleeping: ThreadList::new(),
    current: CpuLockCell::new(None),
    tick_count: CpuLockCell::new(0),
    timers: TimerList::INIT,
};

static CONTEXT_SWITCH_COUNT: AtomicU64 = AtomicU64::new(0);

#[inline]
pub(crate) fn state() -> &'static KernelState {
    &STATE
}

/// Install the port and start the kernel.
///
/// The calling context is adopted as `main_thread`, which must have been
/// constructed with [`ThreadCb::new_main`] and must outrank the idle thread.
/// The kernel's idle thread is registered here as well. No context switch is
/// requested; the caller keeps running as the highest-priority thread.
///
/// # Errors
///
/// - `EPERM` - the kernel is already initialized.
/// - `EINVAL` - `main_thread` is not a fresh `new_main` control block.
pub fn initialize(port: &'static Port, main_thread: &'static ThreadCb) -> Result<(), Errno> {
    port::install(port)?;
    let mut lock = klock::lock_cpu()?;

    if main_thread.state.get(&*lock) != ThreadState::Created
        || main_thread.base_priority.get(&*lock) == IDLE_PRIORITY
        || main_thread.stack_size != 0
    {
        return Err(Errno::EINVAL);
    }

    let idle = &thread::IDLE_THREAD;
    // Safety: the idle stack is kernel-owned static storage
    let idle_sp = unsafe {
        (port.initialize_stack)(
            idle.stack_base,
            idle.stack_size,
            thread_start,
            idle as *const ThreadCb as usize,
        )
    };
    idle.stack_pointer.replace(&mut *lock, idle_sp);
    idle.state.replace(&mut *lock, ThreadState::Runnable);
    STATE.runnable.insert_thread(lock.borrow_mut(), idle);

    main_thread.state.replace(&mut *lock, ThreadState::Runnable);
    STATE.runnable.insert_thread(lock.borrow_mut(), main_thread);
    STATE.current.replace(&mut *lock, Some(main_thread));
    Ok(())
}

/// Request a context switch through the port if the running thread is no
/// longer the head of the runnable list.
///
/// Equal-priority ties favor the running thread: a thread that was not
/// explicitly rotated stays ahead of later arrivals in its band.
pub(crate) fn maybe_request_context_switch(lock: CpuLockTokenRefMut<'_>) {
    let current = STATE.current.get(&*lock);
    let head = STATE.runnable.front(&*lock);
    let switch = match (current, head) {
        (Some(current), Some(head)) => !ptr::eq(current, head),
        _ => true,
    };
    if switch {
        (port::get().request_context_switch)();
    }
}

/// Move the running thread off the runnable list into `list`, yield, and
/// translate the eventual unblock reason.
///
/// When `deadline` is given, a one-shot timeout is armed that releases the
/// thread with reason `Timeout`; a deadline that already passed fails with
/// `ETIMEDOUT` without blocking.
///
/// Returns once the thread runs again. The unblock reason is consumed
/// exactly once: `Timeout` becomes `ETIMEDOUT`, `Signal` becomes `EINTR`,
/// everything else is success.
pub(crate) fn block_current(
    mut lock: CpuLockGuard,
    list: &'static ThreadList,
    new_state: ThreadState,
    functor: UnblockFunctor,
    deadline: Option<u64>,
) -> Result<(), Errno> {
    let port = port::get();
    if (port.is_interrupt_context)() {
        if cfg!(debug_assertions) {
            (port.fatal_error)("blocking operation in interrupt context");
        }
        return Err(Errno::EPERM);
    }
    if let Some(deadline) = deadline {
        if deadline <= STATE.tick_count.get(&*lock) {
            return Err(Errno::ETIMEDOUT);
        }
    }

    // Invariant: a current thread exists once the kernel is initialized
    let tcb = STATE.current.get(&*lock).unwrap();
    STATE.runnable.remove_thread(lock.borrow_mut(), tcb);
    tcb.state.replace(&mut *lock, new_state);
    tcb.unblock_reason.replace(&mut *lock, None);
    tcb.unblock_functor.replace(&mut *lock, functor);
    list.insert_thread(lock.borrow_mut(), tcb);
    if let Some(deadline) = deadline {
        timer::arm_thread_wakeup(lock.borrow_mut(), tcb, deadline);
    }
    (port.request_context_switch)();
    drop(lock); // the context switch happens as the mask clears

    // ----- execution resumes here once the thread is unblocked -----

    let mut lock = klock::lock_cpu()?;
    let reason = tcb.unblock_reason.replace(&mut *lock, None);
    drop(lock);
    match reason {
        Some(UnblockReason::Timeout) => Err(Errno::ETIMEDOUT),
        Some(UnblockReason::Signal) => Err(Errno::EINTR),
        _ => Ok(()),
    }
}

/// Move some other `Runnable` thread into `list`. The caller does not
/// yield.
pub(crate) fn block_task(
    mut lock: CpuLockTokenRefMut<'_>,
    tcb: &'static ThreadCb,
    list: &'static ThreadList,
    new_state: ThreadState,
    functor: UnblockFunctor,
) -> Result<(), Errno> {
    if tcb.state.get(&*lock) != ThreadState::Runnable {
        return Err(Errno::EINVAL);
    }
    if let Some(current) = STATE.current.get(&*lock) {
        if ptr::eq(current, tcb) {
            return Err(Errno::EINVAL);
        }
    }
    STATE.runnable.remove_thread(lock.borrow_mut(), tcb);
    tcb.state.replace(&mut *lock, new_state);
    tcb.unblock_reason.replace(&mut *lock, None);
    tcb.unblock_functor.replace(&mut *lock, functor);
    list.insert_thread(lock.borrow_mut(), tcb);
    Ok(())
}

/// Release a blocked (or suspended) thread: unlink it from whatever list
/// holds it, record `reason`, run and clear its unblock functor, re-insert
/// it into the runnable list, cancel any pending timeout, and request a
/// context switch if it now outranks the running thread.
pub(crate) fn unblock_locked(
    mut lock: CpuLockTokenRefMut<'_>,
    tcb: &'static ThreadCb,
    reason: UnblockReason,
) -> Result<(), Errno> {
    match tcb.state.get(&*lock) {
        ThreadState::Created | ThreadState::Runnable | ThreadState::Terminated => {
            return Err(Errno::EINVAL)
        }
        _ => {}
    }
    // Invariant: a blocked thread is always a member of exactly one list
    let list = tcb.current_list.get(&*lock).unwrap();
    list.remove_thread(lock.borrow_mut(), tcb);
    timer::disarm_thread_wakeup(lock.borrow_mut(), tcb);
    tcb.unblock_reason.replace(&mut *lock, Some(reason));
    let functor = tcb.unblock_functor.replace(&mut *lock, UnblockFunctor::NoOp);
    match functor {
        UnblockFunctor::NoOp => {}
        UnblockFunctor::MutexHandoff(mutex_cb) => {
            mutex::on_waiter_unblocked(lock.borrow_mut(), mutex_cb, tcb, reason);
        }
    }
    tcb.state.replace(&mut *lock, ThreadState::Runnable);
    tcb.quantum.replace(&mut *lock, ROUND_ROBIN_QUANTUM);
    STATE.runnable.insert_thread(lock.borrow_mut(), tcb);
    maybe_request_context_switch(lock);
    Ok(())
}

/// Release a blocked thread with reason `UnblockRequest`. Interrupt-safe.
///
/// # Errors
///
/// - `EINVAL` - the thread is not blocked.
pub fn unblock(tcb: &'static ThreadCb) -> Result<(), Errno> {
    unblock_with(tcb, UnblockReason::UnblockRequest)
}

/// Release a blocked thread with an explicit reason. Interrupt-safe.
pub fn unblock_with(tcb: &'static ThreadCb, reason: UnblockReason) -> Result<(), Errno> {
    let mut lock = klock::lock_cpu()?;
    unblock_locked(lock.borrow_mut(), tcb, reason)
}

/// Suspend the calling thread until [`resume`] is called on it.
///
/// # Errors
///
/// - `EINTR` - the suspension was interrupted by a signal.
pub fn suspend() -> Result<(), Errno> {
    let lock = klock::lock_cpu()?;
    match block_current(
        lock,
        &STATE.suspended,
        ThreadState::Suspended,
        UnblockFunctor::NoOp,
        None,
    ) {
        Ok(()) | Err(Errno::ETIMEDOUT) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Suspend another thread. The target must be `Runnable`. Suspending the
/// calling thread through its own handle behaves like [`suspend`].
pub fn suspend_thread(tcb: &'static ThreadCb) -> Result<(), Errno> {
    let mut lock = klock::lock_cpu()?;
    if let Some(current) = STATE.current.get(&*lock) {
        if ptr::eq(current, tcb) {
            return match block_current(
                lock,
                &STATE.suspended,
                ThreadState::Suspended,
                UnblockFunctor::NoOp,
                None,
            ) {
                Ok(()) | Err(Errno::ETIMEDOUT) => Ok(()),
                Err(e) => Err(e),
            };
        }
    }
    block_task(
        lock.borrow_mut(),
        tcb,
        &STATE.suspended,
        ThreadState::Suspended,
        UnblockFunctor::NoOp,
    )
}

/// Make a suspended thread runnable again. Does not yield; the usual
/// preemption check still applies. Interrupt-safe.
///
/// # Errors
///
/// - `EINVAL` - the thread is not suspended.
pub fn resume(tcb: &'static ThreadCb) -> Result<(), Errno> {
    let mut lock = klock::lock_cpu()?;
    if tcb.state.get(&*lock) != ThreadState::Suspended {
        return Err(Errno::EINVAL);
    }
    unblock_locked(lock.borrow_mut(), tcb, UnblockReason::UnblockRequest)
}

/// Rotate the calling thread to the tail of its priority band and
/// reschedule.
pub fn yield_now() -> Result<(), Errno> {
    let mut lock = klock::lock_cpu()?;
    if (port::get().is_interrupt_context)() {
        return Err(Errno::EPERM);
    }
    let tcb = STATE.current.get(&*lock).unwrap();
    STATE.runnable.remove_thread(lock.borrow_mut(), tcb);
    STATE.runnable.insert_thread(lock.borrow_mut(), tcb);
    maybe_request_context_switch(lock.borrow_mut());
    Ok(())
}

/// Sleep until the absolute tick `deadline`.
///
/// Returns `Ok` when the deadline is reached or the thread is woken early by
/// [`unblock`]; `EINTR` if interrupted by a signal.
pub fn sleep_until(deadline: u64) -> Result<(), Errno> {
    let lock = klock::lock_cpu()?;
    if deadline <= STATE.tick_count.get(&*lock) {
        return Ok(());
    }
    match block_current(
        lock,
        &STATE.sleeping,
        ThreadState::BlockedOnSleep,
        UnblockFunctor::NoOp,
        Some(deadline),
    ) {
        Ok(()) | Err(Errno::ETIMEDOUT) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sleep for `ticks` ticks.
pub fn sleep_for(ticks: u64) -> Result<(), Errno> {
    let lock = klock::lock_cpu()?;
    let deadline = STATE.tick_count.get(&*lock).saturating_add(ticks);
    drop(lock);
    sleep_until(deadline)
}

/// Handler of the tick interrupt, called by the port from interrupt context
/// with the CPU lock inactive.
///
/// Increments the tick count, fires all software timers whose deadline has
/// been reached, charges the running thread's round-robin quantum (rotating
/// it when the quantum expires and an equal-priority peer is runnable), and
/// returns `true` if a context switch is now required.
pub fn tick_interrupt_handler() -> bool {
    let Ok(mut lock) = klock::lock_cpu() else {
        return false;
    };
    let now = STATE.tick_count.get(&*lock) + 1;
    STATE.tick_count.replace(&mut *lock, now);

    let mut lock = timer::fire_expired(lock, now);

    if let Some(tcb) = STATE.current.get(&*lock) {
        if tcb.policy == SchedulingPolicy::RoundRobin
            && tcb.state.get(&*lock) == ThreadState::Runnable
        {
            let quantum = tcb.quantum.get(&*lock).saturating_sub(1);
            tcb.quantum.replace(&mut *lock, quantum);
            if quantum == 0 && has_runnable_peer(&lock, tcb) {
                STATE.runnable.remove_thread(lock.borrow_mut(), tcb);
                STATE.runnable.insert_thread(lock.borrow_mut(), tcb);
                tcb.quantum.replace(&mut *lock, ROUND_ROBIN_QUANTUM);
            }
        }
    }

    let current = STATE.current.get(&*lock);
    let head = STATE.runnable.front(&*lock);
    let switch_required = match (current, head) {
        (Some(current), Some(head)) => !ptr::eq(current, head),
        _ => true,
    };
    if switch_required {
        (port::get().request_context_switch)();
    }
    switch_required
}

/// Whether another thread with the same effective priority as `tcb` is
/// runnable. Equal-priority threads are contiguous in the sorted list, so
/// checking the neighbors suffices.
fn has_runnable_peer(lock: &CpuLockGuard, tcb: &'static ThreadCb) -> bool {
    let Some(link) = tcb.link.get(&**lock) else {
        return false;
    };
    if ptr::eq(link.next, tcb) {
        return false;
    }
    let priority = tcb.effective_priority.get(&**lock);
    link.next.effective_priority.get(&**lock) == priority
        || link.prev.effective_priority.get(&**lock) == priority
}

/// Called by the port at the end of a context-switch request. Saves
/// `stack_pointer` into the outgoing thread, selects the runnable-list head
/// as the new running thread, resets its round-robin quantum, and returns
/// its stored stack pointer.
pub fn switch_context(stack_pointer: usize) -> usize {
    let Ok(mut lock) = klock::lock_cpu() else {
        (port::get().fatal_error)("switch_context called inside the critical section")
    };
    if let Some(prev) = STATE.current.get(&*lock) {
        prev.stack_pointer.replace(&mut *lock, stack_pointer);
        if cfg!(debug_assertions) && prev.stack_size != 0 {
            let base = prev.stack_base as usize;
            if stack_pointer < base || stack_pointer > base + prev.stack_size {
                (port::get().fatal_error)("stack pointer outside the thread's stack");
            }
        }
    }
    // Invariant: the idle thread is always runnable
    let next = match STATE.runnable.front(&*lock) {
        Some(next) => next,
        None => (port::get().fatal_error)("runnable list is empty"),
    };
    STATE.current.replace(&mut *lock, Some(next));
    next.quantum.replace(&mut *lock, ROUND_ROBIN_QUANTUM);
    CONTEXT_SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
    next.stack_pointer.get(&*lock)
}

/// Raise or lower a thread's effective priority, repositioning it in
/// whatever list currently holds it. When the thread is blocked on a
/// priority-inheritance mutex, the change propagates to the mutex's owner,
/// transitively across chains of mutexes.
pub(crate) fn set_effective_priority(
    mut lock: CpuLockTokenRefMut<'_>,
    tcb: &'static ThreadCb,
    priority: Priority,
) {
    let mut tcb = tcb;
    let mut priority = priority;
    loop {
        if tcb.effective_priority.get(&*lock) == priority {
            break;
        }
        tcb.effective_priority.replace(&mut *lock, priority);
        if let Some(list) = tcb.current_list.get(&*lock) {
            list.remove_thread(lock.borrow_mut(), tcb);
            list.insert_thread(lock.borrow_mut(), tcb);
        }
        if tcb.state.get(&*lock) == ThreadState::BlockedOnMutex {
            if let UnblockFunctor::MutexHandoff(mutex_cb) = tcb.unblock_functor.get(&*lock) {
                if mutex_cb.is_priority_inheritance() {
                    if let Some(owner) = mutex_cb.owner.get(&*lock) {
                        priority = mutex::evaluate_effective_priority(lock.borrow_mut(), owner);
                        tcb = owner;
                        continue;
                    }
                }
            }
        }
        break;
    }
    maybe_request_context_switch(lock);
}

/// The thread that is currently executing, if the kernel is initialized.
pub fn current_thread() -> Option<&'static ThreadCb> {
    let lock = klock::lock_cpu().ok()?;
    STATE.current.get(&*lock)
}

/// The current value of the monotonic tick count, read through the port as
/// a single atomic word.
pub fn tick_count() -> u64 {
    match port::try_get() {
        Some(port) => (port.tick_now)(),
        None => 0,
    }
}

/// The number of context switches performed since boot. Monotonic;
/// increments by exactly one per [`switch_context`] call.
pub fn context_switch_count() -> u64 {
    CONTEXT_SWITCH_COUNT.load(Ordering::Relaxed)
}
