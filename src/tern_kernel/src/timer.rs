//! Software timers
//!
//! The supervisor keeps armed timers on an intrusive list sorted by deadline
//! ascending (FIFO among equal deadlines). [`fire_expired`] is called from
//! the tick handler and pops every timer whose deadline has been reached.
//!
//! User callbacks run in interrupt context. The supervisor re-arms periodic
//! timers and releases the kernel lock before invoking the callback, so the
//! callback may use the interrupt-safe subset of the kernel API.
use core::fmt;

use crate::error::Errno;
use crate::klock::{self, CpuLockCell, CpuLockGuard, CpuLockToken, CpuLockTokenRefMut};
use crate::list::{Link, List, Node};
use crate::port;
use crate::sched;
use crate::thread::{ThreadCb, UnblockReason};
use crate::utils::Init;

/// What to do when a timer fires.
#[derive(Clone, Copy)]
pub(crate) enum TimerRoutine {
    None,
    /// Application callback with its parameter.
    User(fn(usize), usize),
    /// Kernel-internal: release the thread with reason `Timeout`.
    ThreadWakeup(&'static ThreadCb),
}

impl Init for TimerRoutine {
    const INIT: Self = Self::None;
}

/// *Software timer control block* - the state data of a software timer.
///
/// Created by the user with a callback; supervised by the kernel while
/// armed. A timer is armed iff it is linked into the supervisor's list.
pub struct TimerCb {
    /// Absolute deadline in ticks.
    pub(crate) deadline: CpuLockCell<u64>,
    /// Re-arm interval in ticks; `0` for one-shot.
    pub(crate) period: CpuLockCell<u64>,
    pub(crate) routine: CpuLockCell<TimerRoutine>,
    pub(crate) link: CpuLockCell<Option<Link<TimerCb>>>,
}

impl Node for TimerCb {
    fn link(&self) -> &CpuLockCell<Option<Link<TimerCb>>> {
        &self.link
    }
}

impl fmt::Debug for TimerCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimerCb").field(&(self as *const _)).finish()
    }
}

pub(crate) type TimerList = List<TimerCb>;

impl TimerCb {
    /// Construct a timer that calls `callback(param)` each time it fires.
    pub const fn new(callback: fn(usize), param: usize) -> Self {
        Self {
            deadline: CpuLockCell::new(0),
            period: CpuLockCell::new(0),
            routine: CpuLockCell::new(TimerRoutine::User(callback, param)),
            link: CpuLockCell::new(None),
        }
    }

    /// Construct the timeout node embedded in every thread control block.
    /// Its routine is assigned when a timed blocking operation arms it.
    pub(crate) const fn new_internal() -> Self {
        Self {
            deadline: CpuLockCell::new(0),
            period: CpuLockCell::new(0),
            routine: CpuLockCell::new(TimerRoutine::None),
            link: CpuLockCell::new(None),
        }
    }

    /// Arm the timer to fire at the absolute tick `deadline`, then every
    /// `period` ticks (`0` for one-shot). Re-arming a timer that is already
    /// armed moves it. Interrupt-safe.
    ///
    /// A deadline at or before the current tick fires on the next tick.
    ///
    /// Catch-up policy for periodic timers: if more than one period has
    /// elapsed by the time the timer is processed, the callback fires once
    /// and the timer is re-armed at `now + period`.
    pub fn arm(&'static self, deadline: u64, period: u64) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        self.disarm_locked(lock.borrow_mut());
        self.deadline.replace(&mut *lock, deadline);
        self.period.replace(&mut *lock, period);
        insert_sorted(lock.borrow_mut(), self);
        Ok(())
    }

    /// Arm a one-shot timer to fire `delay` ticks from now.
    pub fn arm_in(&'static self, delay: u64) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        let deadline = sched::state().tick_count.get(&*lock).saturating_add(delay);
        self.disarm_locked(lock.borrow_mut());
        self.deadline.replace(&mut *lock, deadline);
        self.period.replace(&mut *lock, 0);
        insert_sorted(lock.borrow_mut(), self);
        Ok(())
    }

    /// Arm a periodic timer: first fire after `first_delay` ticks, then
    /// every `period` ticks.
    pub fn arm_periodic(&'static self, first_delay: u64, period: u64) -> Result<(), Errno> {
        if period == 0 {
            return Err(Errno::EINVAL);
        }
        let mut lock = klock::lock_cpu()?;
        let deadline = sched::state()
            .tick_count
            .get(&*lock)
            .saturating_add(first_delay);
        self.disarm_locked(lock.borrow_mut());
        self.deadline.replace(&mut *lock, deadline);
        self.period.replace(&mut *lock, period);
        insert_sorted(lock.borrow_mut(), self);
        Ok(())
    }

    /// Cancel the timer. A no-op if the timer is not armed. Interrupt-safe.
    pub fn disarm(&'static self) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        self.disarm_locked(lock.borrow_mut());
        Ok(())
    }

    pub fn is_armed(&'static self) -> Result<bool, Errno> {
        let lock = klock::lock_cpu()?;
        Ok(self.link.read(&*lock).is_some())
    }

    fn disarm_locked(&'static self, mut lock: CpuLockTokenRefMut<'_>) {
        if self.link.read(&*lock).is_some() {
            sched::state().timers.remove(lock.borrow_mut(), self);
        }
    }
}

fn insert_sorted(lock: CpuLockTokenRefMut<'_>, timer: &'static TimerCb) {
    let timers = &sched::state().timers;
    let deadline = timer.deadline.get(&*lock);
    timers.insert_before(lock, timer, move |token: &CpuLockToken, other: &TimerCb| {
        other.deadline.get(token) > deadline
    });
}

/// Arm the timeout node of `tcb` to release it with reason `Timeout` at the
/// absolute tick `deadline`.
pub(crate) fn arm_thread_wakeup(
    mut lock: CpuLockTokenRefMut<'_>,
    tcb: &'static ThreadCb,
    deadline: u64,
) {
    let timer = &tcb.wakeup_timer;
    debug_assert!(timer.link.read(&*lock).is_none());
    timer.deadline.replace(&mut *lock, deadline);
    timer.period.replace(&mut *lock, 0);
    timer
        .routine
        .replace(&mut *lock, TimerRoutine::ThreadWakeup(tcb));
    insert_sorted(lock, timer);
}

/// Cancel a pending timeout on `tcb`, if any.
pub(crate) fn disarm_thread_wakeup(mut lock: CpuLockTokenRefMut<'_>, tcb: &'static ThreadCb) {
    let timer = &tcb.wakeup_timer;
    if timer.link.read(&*lock).is_some() {
        sched::state().timers.remove(lock.borrow_mut(), timer);
    }
    timer.routine.replace(&mut *lock, TimerRoutine::None);
}

/// Fire every timer whose deadline is at or before `now`. Called from the
/// tick handler with the critical section held; the lock is released around
/// application callbacks only.
pub(crate) fn fire_expired(mut lock: CpuLockGuard, now: u64) -> CpuLockGuard {
    let timers = &sched::state().timers;
    // Re-read the head on every iteration: callbacks may arm or disarm
    // timers, including the one being processed.
    while let Some(timer) = timers.front(&lock) {
        if timer.deadline.get(&*lock) > now {
            break;
        }
        timers.remove(lock.borrow_mut(), timer);

        let period = timer.period.get(&*lock);
        if period > 0 {
            let natural = timer.deadline.get(&*lock).saturating_add(period);
            // One-fire-then-slip: if several periods have already elapsed,
            // fire once and resume the cadence from now.
            let next = if natural <= now { now.saturating_add(period) } else { natural };
            timer.deadline.replace(&mut *lock, next);
            insert_sorted(lock.borrow_mut(), timer);
        }

        match timer.routine.get(&*lock) {
            TimerRoutine::None => {}
            TimerRoutine::ThreadWakeup(tcb) => {
                timer.routine.replace(&mut *lock, TimerRoutine::None);
                // Resolved in the critical section: if the thread was already
                // released for another reason, this is a no-op.
                let _ = sched::unblock_locked(lock.borrow_mut(), tcb, UnblockReason::Timeout);
            }
            TimerRoutine::User(callback, param) => {
                drop(lock);
                callback(param);
                lock = match klock::lock_cpu() {
                    Ok(lock) => lock,
                    Err(_) => (port::get().fatal_error)(
                        "timer callback left the CPU lock active",
                    ),
                };
            }
        }
    }
    lock
}
