//! Condition variables
use core::fmt;

use crate::error::Errno;
use crate::klock;
use crate::list::ThreadList;
use crate::mutex::{self, MutexCb};
use crate::sched;
use crate::thread::{ThreadState, UnblockFunctor, UnblockReason};

/// *Condition variable control block*.
///
/// Waiting atomically releases the associated mutex and blocks; the mutex is
/// re-acquired before the wait returns, whatever the outcome.
pub struct CondVarCb {
    wait_list: ThreadList,
}

impl fmt::Debug for CondVarCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CondVarCb")
            .field(&(self as *const _))
            .finish()
    }
}

impl Default for CondVarCb {
    fn default() -> Self {
        Self::new()
    }
}

impl CondVarCb {
    pub const fn new() -> Self {
        Self {
            wait_list: ThreadList::new(),
        }
    }

    /// Release `mutex`, block until notified, then re-acquire `mutex`.
    ///
    /// # Errors
    ///
    /// - `EPERM` - the caller does not own `mutex`, or owns it recursively.
    /// - `EINTR` - the wait was interrupted by a signal (the mutex is still
    ///   re-acquired).
    pub fn wait(&'static self, mutex: &'static MutexCb) -> Result<(), Errno> {
        self.wait_common(mutex, None)
    }

    /// Like [`CondVarCb::wait`], giving up at the absolute tick `deadline`.
    ///
    /// # Errors
    ///
    /// - `ETIMEDOUT` - the deadline passed without a notification (the
    ///   mutex is still re-acquired).
    pub fn wait_until(&'static self, mutex: &'static MutexCb, deadline: u64) -> Result<(), Errno> {
        self.wait_common(mutex, Some(deadline))
    }

    /// Like [`CondVarCb::wait`], giving up after `ticks` ticks.
    pub fn wait_for(&'static self, mutex: &'static MutexCb, ticks: u64) -> Result<(), Errno> {
        let lock = klock::lock_cpu()?;
        let deadline = sched::state().tick_count.get(&*lock).saturating_add(ticks);
        drop(lock);
        self.wait_common(mutex, Some(deadline))
    }

    fn wait_common(&'static self, mutex: &'static MutexCb, deadline: Option<u64>) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        let tcb = sched::state().current.get(&*lock).unwrap();

        // Release the mutex and block in one critical section, so a
        // notification between the two cannot be lost
        mutex::release_for_condition_wait(lock.borrow_mut(), mutex, tcb)?;
        let wait_result = sched::block_current(
            lock,
            &self.wait_list,
            ThreadState::BlockedOnCondition,
            UnblockFunctor::NoOp,
            deadline,
        );

        // Re-acquire the mutex whatever the wait outcome
        match mutex.lock() {
            Ok(()) => wait_result,
            Err(e) => Err(e),
        }
    }

    /// Release the earliest highest-priority waiter, if any. Interrupt-safe.
    pub fn notify_one(&'static self) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        if let Some(waiter) = self.wait_list.front(&*lock) {
            let _ = sched::unblock_locked(
                lock.borrow_mut(),
                waiter,
                UnblockReason::UnblockRequest,
            );
        }
        Ok(())
    }

    /// Release every waiter. Interrupt-safe.
    pub fn notify_all(&'static self) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        while let Some(waiter) = self.wait_list.front(&*lock) {
            let _ = sched::unblock_locked(
                lock.borrow_mut(),
                waiter,
                UnblockReason::UnblockRequest,
            );
        }
        Ok(())
    }
}
