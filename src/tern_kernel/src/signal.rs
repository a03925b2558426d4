//! Signals
//!
//! Each thread owns a small edge-triggered signal set. Generating a signal
//! for a thread that is blocked in an interruptible wait releases it with
//! reason `Signal`, which the in-progress primitive translates to `EINTR`.
//! Mutex waits are deliberately not interruptible.
use crate::error::Errno;
use crate::klock;
use crate::sched;
use crate::thread::{ThreadCb, ThreadState, UnblockReason};

/// A set of pending signals, one bit per signal number.
pub type SignalSet = u32;

/// The number of distinct signals.
pub const NUM_SIGNALS: u8 = 32;

/// Set `signal` pending for `tcb` and, if the thread is blocked in an
/// interruptible wait, release it with reason `Signal`. Interrupt-safe.
///
/// # Errors
///
/// - `EINVAL` - `signal` is not below [`NUM_SIGNALS`].
pub fn generate(tcb: &'static ThreadCb, signal: u8) -> Result<(), Errno> {
    if signal >= NUM_SIGNALS {
        return Err(Errno::EINVAL);
    }
    let mut lock = klock::lock_cpu()?;
    let pending = tcb.pending_signals.get(&*lock);
    tcb.pending_signals.replace(&mut *lock, pending | 1 << signal);
    if admits_interruption(tcb.state.get(&*lock)) {
        let _ = sched::unblock_locked(lock.borrow_mut(), tcb, UnblockReason::Signal);
    }
    Ok(())
}

/// Clear `signal` from the calling thread's pending set. Returns whether it
/// was pending.
///
/// # Errors
///
/// - `EINVAL` - `signal` is not below [`NUM_SIGNALS`].
pub fn accept(signal: u8) -> Result<bool, Errno> {
    if signal >= NUM_SIGNALS {
        return Err(Errno::EINVAL);
    }
    let mut lock = klock::lock_cpu()?;
    let tcb = sched::state().current.get(&*lock).unwrap();
    let pending = tcb.pending_signals.get(&*lock);
    let bit = 1 << signal;
    tcb.pending_signals.replace(&mut *lock, pending & !bit);
    Ok(pending & bit != 0)
}

/// The calling thread's pending signal set.
pub fn pending() -> Result<SignalSet, Errno> {
    let lock = klock::lock_cpu()?;
    let tcb = sched::state().current.get(&*lock).unwrap();
    Ok(tcb.pending_signals.get(&*lock))
}

/// The pending signal set of an arbitrary thread.
pub fn pending_of(tcb: &'static ThreadCb) -> Result<SignalSet, Errno> {
    let lock = klock::lock_cpu()?;
    Ok(tcb.pending_signals.get(&*lock))
}

/// Whether a signal may cut a wait in the given state short.
fn admits_interruption(state: ThreadState) -> bool {
    matches!(
        state,
        ThreadState::BlockedOnSemaphore
            | ThreadState::BlockedOnCondition
            | ThreadState::BlockedOnJoin
            | ThreadState::BlockedOnSleep
            | ThreadState::Suspended
    )
}
