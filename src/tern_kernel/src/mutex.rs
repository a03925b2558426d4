//! Mutexes
use core::fmt;
use core::ptr;

use crate::error::Errno;
use crate::klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut};
use crate::list::ThreadList;
use crate::sched;
use crate::thread::{Priority, ThreadCb, ThreadState, UnblockFunctor, UnblockReason};
use crate::utils::Init;

/// The locking protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// No priority adjustment.
    Normal,
    /// While the owner blocks a higher-priority waiter, the owner's
    /// effective priority is lifted to the highest waiter's, transitively
    /// across chains of mutexes.
    PriorityInheritance,
    /// Locking immediately raises the owner's effective priority to the
    /// ceiling. Threads whose base priority exceeds the ceiling may not
    /// lock the mutex.
    PriorityProtect(Priority),
}

/// Whether the owner may lock the mutex again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    NonRecursive,
    Recursive,
}

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb {
    protocol: MutexProtocol,
    kind: MutexKind,

    /// The thread that currently owns the lock.
    pub(crate) owner: CpuLockCell<Option<&'static ThreadCb>>,

    /// Recursion depth; at least 1 while owned.
    depth: CpuLockCell<usize>,

    /// Set when an owner exits without unlocking. The next thread to
    /// acquire the lock observes `EOWNERDEAD` once.
    inconsistent: CpuLockCell<bool>,

    /// Threads blocked in `lock`, priority-ordered.
    wait_list: ThreadList,

    /// The next element in the singly-linked chain headed by
    /// [`ThreadCb::last_mutex_held`], containing all mutexes currently held
    /// by the owner.
    pub(crate) prev_held: CpuLockCell<Option<&'static MutexCb>>,
}

impl fmt::Debug for MutexCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MutexCb").field(&(self as *const _)).finish()
    }
}

impl Init for MutexCb {
    const INIT: Self = Self::new(MutexKind::NonRecursive, MutexProtocol::Normal);
}

impl MutexCb {
    pub const fn new(kind: MutexKind, protocol: MutexProtocol) -> Self {
        Self {
            protocol,
            kind,
            owner: CpuLockCell::new(None),
            depth: CpuLockCell::new(0),
            inconsistent: CpuLockCell::new(false),
            wait_list: ThreadList::new(),
            prev_held: CpuLockCell::new(None),
        }
    }

    pub(crate) fn is_priority_inheritance(&self) -> bool {
        matches!(self.protocol, MutexProtocol::PriorityInheritance)
    }

    /// Acquire the mutex, blocking as long as another thread owns it.
    ///
    /// Mutex waits are not interruptible by signals; `EINTR` is never
    /// returned.
    ///
    /// # Errors
    ///
    /// - `EDEADLK` - the calling thread already owns a non-recursive mutex.
    /// - `EAGAIN` - the recursion depth counter would overflow.
    /// - `EINVAL` - the caller's base priority exceeds the priority-protect
    ///   ceiling.
    /// - `EOWNERDEAD` - the lock was acquired, but its previous owner exited
    ///   while holding it.
    pub fn lock(&'static self) -> Result<(), Errno> {
        let lock = klock::lock_cpu()?;
        self.lock_common(lock, Blocking::Indefinite)
    }

    /// Acquire the mutex only if that is possible without blocking.
    ///
    /// # Errors
    ///
    /// - `EBUSY` - the mutex is held by another thread.
    pub fn try_lock(&'static self) -> Result<(), Errno> {
        let lock = klock::lock_cpu()?;
        self.lock_common(lock, Blocking::No)
    }

    /// Acquire the mutex, giving up at the absolute tick `deadline`.
    ///
    /// # Errors
    ///
    /// - `ETIMEDOUT` - the deadline passed before the lock was acquired.
    pub fn try_lock_until(&'static self, deadline: u64) -> Result<(), Errno> {
        let lock = klock::lock_cpu()?;
        self.lock_common(lock, Blocking::Until(deadline))
    }

    /// Acquire the mutex, giving up after `ticks` ticks.
    pub fn try_lock_for(&'static self, ticks: u64) -> Result<(), Errno> {
        let lock = klock::lock_cpu()?;
        let deadline = sched::state().tick_count.get(&*lock).saturating_add(ticks);
        self.lock_common(lock, Blocking::Until(deadline))
    }

    /// Release the mutex.
    ///
    /// At recursion depth zero the lock changes hands: the head waiter, if
    /// any, becomes the owner, with inheritance and ceiling adjustments
    /// applied as the mutex is handed over.
    ///
    /// # Errors
    ///
    /// - `EPERM` - the calling thread does not own the mutex.
    pub fn unlock(&'static self) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        let tcb = sched::state().current.get(&*lock).unwrap();
        match self.owner.get(&*lock) {
            Some(owner) if ptr::eq(owner, tcb) => {}
            _ => return Err(Errno::EPERM),
        }
        let depth = self.depth.get(&*lock);
        if depth > 1 {
            self.depth.replace(&mut *lock, depth - 1);
            return Ok(());
        }
        unlock_locked(lock.borrow_mut(), self, tcb);
        Ok(())
    }

    /// Whether the mutex is currently owned by some thread.
    pub fn is_locked(&'static self) -> Result<bool, Errno> {
        let lock = klock::lock_cpu()?;
        Ok(self.owner.read(&*lock).is_some())
    }

    fn lock_common(&'static self, mut lock: CpuLockGuard, blocking: Blocking) -> Result<(), Errno> {
        let tcb = sched::state().current.get(&*lock).unwrap();

        if let Some(owner) = self.owner.get(&*lock) {
            if ptr::eq(owner, tcb) {
                return match self.kind {
                    MutexKind::Recursive => {
                        let depth = self.depth.get(&*lock);
                        let depth = depth.checked_add(1).ok_or(Errno::EAGAIN)?;
                        self.depth.replace(&mut *lock, depth);
                        Ok(())
                    }
                    MutexKind::NonRecursive => Err(Errno::EDEADLK),
                };
            }
        }

        if let MutexProtocol::PriorityProtect(ceiling) = self.protocol {
            if tcb.base_priority.get(&*lock) > ceiling {
                return Err(Errno::EINVAL);
            }
        }

        if self.owner.read(&*lock).is_none() {
            self.grant(lock.borrow_mut(), tcb);
            return self.consume_inconsistency(lock.borrow_mut());
        }

        // Settle the no-wait outcomes before any priority bookkeeping, so a
        // lock that won't be waited for leaves the owner untouched
        let deadline = match blocking {
            Blocking::No => return Err(Errno::EBUSY),
            Blocking::Indefinite => None,
            Blocking::Until(deadline) => {
                if deadline <= sched::state().tick_count.get(&*lock) {
                    return Err(Errno::ETIMEDOUT);
                }
                Some(deadline)
            }
        };

        // Lend the waiter's priority to the owner before going to sleep
        if self.is_priority_inheritance() {
            let owner = self.owner.get(&*lock).unwrap();
            let lifted = owner
                .effective_priority
                .get(&*lock)
                .max(tcb.effective_priority.get(&*lock));
            sched::set_effective_priority(lock.borrow_mut(), owner, lifted);
        }
        sched::block_current(
            lock,
            &self.wait_list,
            ThreadState::BlockedOnMutex,
            UnblockFunctor::MutexHandoff(self),
            deadline,
        )?;

        // Ownership was handed over by the unblocker
        let mut lock = klock::lock_cpu()?;
        debug_assert!(matches!(
            *self.owner.read(&*lock),
            Some(owner) if ptr::eq(owner, tcb)
        ));
        self.consume_inconsistency(lock.borrow_mut())
    }

    /// Give the ownership of the mutex to `tcb` and apply the ceiling
    /// protocol. The thread must be running or in the middle of being
    /// unblocked.
    fn grant(&'static self, mut lock: CpuLockTokenRefMut<'_>, tcb: &'static ThreadCb) {
        self.owner.replace(&mut *lock, Some(tcb));
        self.depth.replace(&mut *lock, 1);
        let prev = tcb.last_mutex_held.replace(&mut *lock, Some(self));
        self.prev_held.replace(&mut *lock, prev);
        if let MutexProtocol::PriorityProtect(ceiling) = self.protocol {
            if ceiling > tcb.effective_priority.get(&*lock) {
                sched::set_effective_priority(lock, tcb, ceiling);
            }
        }
    }

    fn consume_inconsistency(&'static self, mut lock: CpuLockTokenRefMut<'_>) -> Result<(), Errno> {
        if self.inconsistent.replace(&mut *lock, false) {
            Err(Errno::EOWNERDEAD)
        } else {
            Ok(())
        }
    }
}

enum Blocking {
    No,
    Indefinite,
    Until(u64),
}

/// Release `mutex_cb` owned by `owner`, waking up the next waiter (if any),
/// which takes over the ownership through its unblock functor.
///
/// Restores the owner's effective priority to the maximum of its base
/// priority and everything it still inherits from other held mutexes.
pub(crate) fn unlock_locked(
    mut lock: CpuLockTokenRefMut<'_>,
    mutex_cb: &'static MutexCb,
    owner: &'static ThreadCb,
) {
    remove_from_held_chain(lock.borrow_mut(), owner, mutex_cb);
    mutex_cb.depth.replace(&mut *lock, 0);

    let effective = evaluate_effective_priority(lock.borrow_mut(), owner);
    sched::set_effective_priority(lock.borrow_mut(), owner, effective);

    if let Some(waiter) = mutex_cb.wait_list.front(&*lock) {
        let _ = sched::unblock_locked(lock.borrow_mut(), waiter, UnblockReason::MutexUnlock);
    } else {
        mutex_cb.owner.replace(&mut *lock, None);
    }
}

/// Release a mutex on behalf of a condition-variable wait. Fails unless the
/// calling thread owns the mutex at recursion depth one.
pub(crate) fn release_for_condition_wait(
    mut lock: CpuLockTokenRefMut<'_>,
    mutex_cb: &'static MutexCb,
    tcb: &'static ThreadCb,
) -> Result<(), Errno> {
    match mutex_cb.owner.get(&*lock) {
        Some(owner) if ptr::eq(owner, tcb) => {}
        _ => return Err(Errno::EPERM),
    }
    if mutex_cb.depth.get(&*lock) > 1 {
        return Err(Errno::EPERM);
    }
    unlock_locked(lock.borrow_mut(), mutex_cb, tcb);
    Ok(())
}

/// The unblock functor of a mutex waiter.
///
/// On `MutexUnlock`, the waiter is the new owner: ownership is transferred
/// and the ceiling applied before the waiter re-enters the runnable list.
/// On any other reason the waiter abandoned the wait, so any priority it
/// lent to the owner is re-evaluated.
pub(crate) fn on_waiter_unblocked(
    mut lock: CpuLockTokenRefMut<'_>,
    mutex_cb: &'static MutexCb,
    waiter: &'static ThreadCb,
    reason: UnblockReason,
) {
    match reason {
        UnblockReason::MutexUnlock => {
            mutex_cb.grant(lock, waiter);
        }
        _ => {
            if mutex_cb.is_priority_inheritance() {
                if let Some(owner) = mutex_cb.owner.get(&*lock) {
                    let effective = evaluate_effective_priority(lock.borrow_mut(), owner);
                    sched::set_effective_priority(lock.borrow_mut(), owner, effective);
                }
            }
        }
    }
}

/// Reevaluate the thread's effective priority from its base priority and
/// every mutex it currently holds: priority-protect mutexes contribute
/// their ceiling, priority-inheritance mutexes the priority of their
/// highest waiter. (This function doesn't update
/// [`ThreadCb::effective_priority`].)
pub(crate) fn evaluate_effective_priority(
    lock: CpuLockTokenRefMut<'_>,
    tcb: &'static ThreadCb,
) -> Priority {
    let mut effective = tcb.base_priority.get(&*lock);
    let mut held = tcb.last_mutex_held.get(&*lock);
    while let Some(mutex_cb) = held {
        match mutex_cb.protocol {
            MutexProtocol::Normal => {}
            MutexProtocol::PriorityProtect(ceiling) => effective = effective.max(ceiling),
            MutexProtocol::PriorityInheritance => {
                if let Some(waiter) = mutex_cb.wait_list.front(&*lock) {
                    effective = effective.max(waiter.effective_priority.get(&*lock));
                }
            }
        }
        held = mutex_cb.prev_held.get(&*lock);
    }
    effective
}

/// Whether every priority-protect mutex held by `tcb` tolerates the new
/// base priority. Only needed when raising the priority.
pub(crate) fn held_mutexes_allow_base_priority(
    lock: CpuLockTokenRefMut<'_>,
    tcb: &'static ThreadCb,
    new_base: Priority,
) -> bool {
    let mut held = tcb.last_mutex_held.get(&*lock);
    while let Some(mutex_cb) = held {
        if let MutexProtocol::PriorityProtect(ceiling) = mutex_cb.protocol {
            if ceiling < new_base {
                return false;
            }
        }
        held = mutex_cb.prev_held.get(&*lock);
    }
    true
}

/// Whether the mutex `tcb` is currently waiting for (if any) tolerates the
/// new base priority.
pub(crate) fn waited_mutex_allows_base_priority(
    lock: CpuLockTokenRefMut<'_>,
    tcb: &'static ThreadCb,
    new_base: Priority,
) -> bool {
    if tcb.state.get(&*lock) == ThreadState::BlockedOnMutex {
        if let UnblockFunctor::MutexHandoff(mutex_cb) = tcb.unblock_functor.get(&*lock) {
            if let MutexProtocol::PriorityProtect(ceiling) = mutex_cb.protocol {
                return ceiling >= new_base;
            }
        }
    }
    true
}

/// Abandon all mutexes held by an exiting thread. Each mutex is marked
/// inconsistent and handed to its next waiter; the waiter's acquisition
/// reports `EOWNERDEAD`.
///
/// The exiting thread's effective priority is not restored.
pub(crate) fn abandon_held_mutexes(mut lock: CpuLockTokenRefMut<'_>, tcb: &'static ThreadCb) {
    let mut held = tcb.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex_cb) = held {
        held = mutex_cb.prev_held.get(&*lock);
        mutex_cb.prev_held.replace(&mut *lock, None);
        mutex_cb.inconsistent.replace(&mut *lock, true);
        mutex_cb.depth.replace(&mut *lock, 0);
        if let Some(waiter) = mutex_cb.wait_list.front(&*lock) {
            let _ = sched::unblock_locked(lock.borrow_mut(), waiter, UnblockReason::MutexUnlock);
        } else {
            mutex_cb.owner.replace(&mut *lock, None);
        }
    }
}

/// Unlink `mutex_cb` from `owner`'s held chain. Unlocking in any order is
/// allowed; the chain is walked to find the element.
fn remove_from_held_chain(
    mut lock: CpuLockTokenRefMut<'_>,
    owner: &'static ThreadCb,
    mutex_cb: &'static MutexCb,
) {
    let head = owner.last_mutex_held.get(&*lock);
    match head {
        Some(m) if ptr::eq(m, mutex_cb) => {
            let prev = mutex_cb.prev_held.replace(&mut *lock, None);
            owner.last_mutex_held.replace(&mut *lock, prev);
        }
        _ => {
            let mut cursor = head;
            while let Some(m) = cursor {
                let next = m.prev_held.get(&*lock);
                if let Some(n) = next {
                    if ptr::eq(n, mutex_cb) {
                        let prev = mutex_cb.prev_held.replace(&mut *lock, None);
                        m.prev_held.replace(&mut *lock, prev);
                        return;
                    }
                }
                cursor = next;
            }
            debug_assert!(false, "mutex not on the owner's held chain");
        }
    }
}
