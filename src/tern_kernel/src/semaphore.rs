//! Semaphores
use core::fmt;

use crate::error::Errno;
use crate::klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut};
use crate::list::ThreadList;
use crate::sched;
use crate::thread::{ThreadState, UnblockFunctor, UnblockReason};

/// *Semaphore control block* - the state data of a counting semaphore.
pub struct SemaphoreCb {
    pub(crate) value: CpuLockCell<usize>,
    max_value: usize,

    /// Threads blocked in `wait`, priority-ordered; FIFO within a band.
    wait_list: ThreadList,
}

impl fmt::Debug for SemaphoreCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SemaphoreCb")
            .field(&(self as *const _))
            .finish()
    }
}

impl SemaphoreCb {
    /// Construct a semaphore with the given initial and maximum value.
    pub const fn new(initial: usize, max_value: usize) -> Self {
        assert!(initial <= max_value);
        Self {
            value: CpuLockCell::new(initial),
            max_value,
            wait_list: ThreadList::new(),
        }
    }

    /// Decrement the value, blocking while it is zero.
    ///
    /// # Errors
    ///
    /// - `EINTR` - the wait was interrupted by a signal.
    pub fn wait(&'static self) -> Result<(), Errno> {
        let lock = klock::lock_cpu()?;
        self.wait_common(lock, None)
    }

    /// Decrement the value only if that is possible without blocking.
    /// Interrupt-safe.
    ///
    /// # Errors
    ///
    /// - `EAGAIN` - the value is zero.
    pub fn try_wait(&'static self) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        let value = self.value.get(&*lock);
        if value > 0 {
            self.value.replace(&mut *lock, value - 1);
            Ok(())
        } else {
            Err(Errno::EAGAIN)
        }
    }

    /// Decrement the value, giving up at the absolute tick `deadline`.
    ///
    /// # Errors
    ///
    /// - `ETIMEDOUT` - the deadline passed while the value was zero.
    pub fn try_wait_until(&'static self, deadline: u64) -> Result<(), Errno> {
        let lock = klock::lock_cpu()?;
        self.wait_common(lock, Some(deadline))
    }

    /// Decrement the value, giving up after `ticks` ticks.
    pub fn try_wait_for(&'static self, ticks: u64) -> Result<(), Errno> {
        let lock = klock::lock_cpu()?;
        let deadline = sched::state().tick_count.get(&*lock).saturating_add(ticks);
        self.wait_common(lock, Some(deadline))
    }

    fn wait_common(&'static self, mut lock: CpuLockGuard, deadline: Option<u64>) -> Result<(), Errno> {
        let value = self.value.get(&*lock);
        if value > 0 {
            self.value.replace(&mut *lock, value - 1);
            return Ok(());
        }
        // A post hands its unit directly to the released thread, so success
        // here means the unit is ours without touching `value`.
        sched::block_current(
            lock,
            &self.wait_list,
            ThreadState::BlockedOnSemaphore,
            UnblockFunctor::NoOp,
            deadline,
        )
    }

    /// Increment the value or, if threads are waiting, hand one unit
    /// directly to the earliest highest-priority waiter without touching the
    /// value. Interrupt-safe.
    ///
    /// # Errors
    ///
    /// - `EAGAIN` - the value is already at the maximum.
    pub fn post(&'static self) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        if let Some(waiter) = self.wait_list.front(&*lock) {
            // `unblock_locked` can't fail here: the waiter is blocked
            let _ = sched::unblock_locked(
                lock.borrow_mut(),
                waiter,
                UnblockReason::UnblockRequest,
            );
            return Ok(());
        }
        let value = self.value.get(&*lock);
        if value >= self.max_value {
            return Err(Errno::EAGAIN);
        }
        self.value.replace(&mut *lock, value + 1);
        Ok(())
    }

    /// The current value. Zero while threads are waiting.
    pub fn value(&'static self) -> Result<usize, Errno> {
        let lock = klock::lock_cpu()?;
        Ok(self.value.get(&*lock))
    }

    pub fn max_value(&self) -> usize {
        self.max_value
    }

    /// Set the value directly, releasing waiters with reason `Reset` while
    /// the new value allows. Used to re-initialize a semaphore that guards a
    /// re-attached buffer.
    pub(crate) fn set_value_locked(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_>,
        mut value: usize,
    ) {
        while value > 0 {
            let Some(waiter) = self.wait_list.front(&*lock) else {
                break;
            };
            let _ = sched::unblock_locked(lock.borrow_mut(), waiter, UnblockReason::Reset);
            value -= 1;
        }
        self.value.replace(&mut *lock, value);
    }
}
