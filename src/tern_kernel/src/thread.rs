//! Threads
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr;

use crate::error::Errno;
use crate::klock::{self, CpuLockCell};
use crate::list::{Link, Node, ThreadList};
use crate::mutex::{self, MutexCb};
use crate::port;
use crate::sched;
use crate::signal::SignalSet;
use crate::timer::TimerCb;
use crate::utils::Init;

/// A thread priority. Larger values are higher; `0` is reserved for the idle
/// thread.
pub type Priority = u8;

/// The priority of the idle thread. No other thread may use it.
pub const IDLE_PRIORITY: Priority = 0;

/// The number of ticks a round-robin thread may run before it is rotated to
/// the tail of its priority band.
pub const ROUND_ROBIN_QUANTUM: u8 = 10;

pub(crate) const IDLE_STACK_SIZE: usize = 1024;

/// Determines what happens when threads of equal priority compete for the
/// processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Run until blocked or preempted by a higher priority.
    Fifo,
    /// Like `Fifo`, but rotate within the priority band when the round-robin
    /// quantum expires.
    RoundRobin,
}

/// Thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed but not yet added to the scheduler.
    Created,
    /// Eligible to run. The currently executing thread is also `Runnable`.
    Runnable,
    BlockedOnMutex,
    BlockedOnSemaphore,
    BlockedOnCondition,
    BlockedOnJoin,
    BlockedOnSleep,
    Suspended,
    /// The thread exited. This transition is one-way.
    Terminated,
}

/// Why a blocked thread was released. Consumed exactly once by the primitive
/// the thread was blocked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    /// An explicit wake-up: `resume`, a semaphore handoff, a condition
    /// notification, or a direct `unblock` call.
    UnblockRequest,
    /// The deadline armed by a timed blocking operation passed.
    Timeout,
    /// A signal was generated for the thread.
    Signal,
    /// A mutex changed hands and the thread is the new owner.
    MutexUnlock,
    /// The primitive the thread was waiting on was reset by its owner.
    Reset,
}

/// Work the scheduler performs on behalf of a primitive immediately before a
/// thread is re-inserted into the runnable list.
#[derive(Clone, Copy)]
pub(crate) enum UnblockFunctor {
    NoOp,
    /// The thread is (or was) waiting on the given mutex; ownership and
    /// priority bookkeeping must be updated according to the unblock reason.
    MutexHandoff(&'static MutexCb),
}

impl Init for UnblockFunctor {
    const INIT: Self = Self::NoOp;
}

/// Stack storage for one thread, supplied by the user in `'static` memory.
#[repr(align(8))]
pub struct StackStorage<const N: usize>(pub(crate) UnsafeCell<[MaybeUninit<u8>; N]>);

// Safety: safe code can't access the contents; the kernel hands the region
// to exactly one thread.
unsafe impl<const N: usize> Sync for StackStorage<N> {}

impl<const N: usize> StackStorage<N> {
    pub const fn new() -> Self {
        Self(UnsafeCell::new([MaybeUninit::uninit(); N]))
    }
}

impl<const N: usize> Default for StackStorage<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// *Thread control block* - the state data of a thread.
///
/// Constructed by the user in `'static` storage and registered with the
/// scheduler by [`ThreadCb::start`]. The kernel never allocates. A thread
/// control block must not be destroyed while the thread's state is anything
/// other than `Created` or `Terminated`.
pub struct ThreadCb {
    // Static attributes
    pub(crate) entry: fn(usize),
    pub(crate) param: usize,
    pub(crate) stack_base: *mut u8,
    pub(crate) stack_size: usize,
    pub(crate) policy: SchedulingPolicy,

    /// Opaque machine word owned by the port during context switches.
    pub(crate) stack_pointer: CpuLockCell<usize>,

    pub(crate) base_priority: CpuLockCell<Priority>,

    /// The base priority, possibly elevated by a mutex locking protocol.
    /// Determines the thread's position in every priority-ordered list.
    pub(crate) effective_priority: CpuLockCell<Priority>,

    pub(crate) state: CpuLockCell<ThreadState>,

    /// Remaining ticks in the current round-robin time slice.
    pub(crate) quantum: CpuLockCell<u8>,

    /// The list that currently holds this thread, if any. This is a
    /// relation, never ownership; it exists so the scheduler can unlink the
    /// thread in O(1).
    pub(crate) current_list: CpuLockCell<Option<&'static ThreadList>>,
    pub(crate) link: CpuLockCell<Option<Link<ThreadCb>>>,

    pub(crate) unblock_reason: CpuLockCell<Option<UnblockReason>>,
    pub(crate) unblock_functor: CpuLockCell<UnblockFunctor>,

    pub(crate) pending_signals: CpuLockCell<SignalSet>,

    pub(crate) detached: CpuLockCell<bool>,

    /// Threads blocked in [`ThreadCb::join`] on this thread.
    pub(crate) join_list: ThreadList,

    /// Timeout node armed by timed blocking operations. Owned by the
    /// software-timer supervisor while armed; never on two lists at once.
    pub(crate) wakeup_timer: TimerCb,

    /// The most recently locked mutex still held by this thread. Forms a
    /// singly-linked chain through [`MutexCb::prev_held`].
    pub(crate) last_mutex_held: CpuLockCell<Option<&'static MutexCb>>,
}

// Safety: the raw stack fields are written only during construction; all
// other state is behind `CpuLockCell`.
unsafe impl Sync for ThreadCb {}

impl Node for ThreadCb {
    fn link(&self) -> &CpuLockCell<Option<Link<ThreadCb>>> {
        &self.link
    }
}

impl fmt::Debug for ThreadCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ThreadCb").field(&(self as *const _)).finish()
    }
}

impl ThreadCb {
    /// Construct a thread control block.
    ///
    /// `entry(param)` starts executing once the thread is started and first
    /// scheduled. `priority` must be greater than [`IDLE_PRIORITY`]; this is
    /// checked by [`ThreadCb::start`].
    pub const fn new<const N: usize>(
        stack: &'static StackStorage<N>,
        entry: fn(usize),
        param: usize,
        priority: Priority,
        policy: SchedulingPolicy,
    ) -> Self {
        Self::with_raw_stack(stack.0.get() as *mut u8, N, entry, param, priority, policy)
    }

    /// Construct the control block of the thread that calls
    /// [`crate::initialize`]. It has no kernel-managed stack; it is already
    /// running on the boot stack.
    pub const fn new_main(priority: Priority) -> Self {
        fn unreachable_entry(_: usize) {}
        Self::with_raw_stack(
            ptr::null_mut(),
            0,
            unreachable_entry,
            0,
            priority,
            SchedulingPolicy::Fifo,
        )
    }

    pub(crate) const fn with_raw_stack(
        stack_base: *mut u8,
        stack_size: usize,
        entry: fn(usize),
        param: usize,
        priority: Priority,
        policy: SchedulingPolicy,
    ) -> Self {
        Self {
            entry,
            param,
            stack_base,
            stack_size,
            policy,
            stack_pointer: CpuLockCell::new(0),
            base_priority: CpuLockCell::new(priority),
            effective_priority: CpuLockCell::new(priority),
            state: CpuLockCell::new(ThreadState::Created),
            quantum: CpuLockCell::new(ROUND_ROBIN_QUANTUM),
            current_list: CpuLockCell::new(None),
            link: CpuLockCell::new(None),
            unblock_reason: CpuLockCell::new(None),
            unblock_functor: CpuLockCell::new(UnblockFunctor::NoOp),
            pending_signals: CpuLockCell::new(0),
            detached: CpuLockCell::new(false),
            join_list: ThreadList::new(),
            wakeup_timer: TimerCb::new_internal(),
            last_mutex_held: CpuLockCell::new(None),
        }
    }

    /// Register the thread with the scheduler and make it runnable.
    ///
    /// Requests a context switch if the new thread outranks the running one.
    /// Interrupt-safe.
    ///
    /// # Errors
    ///
    /// - `EINVAL` - the thread is already started, has the idle priority, or
    ///   has no stack.
    pub fn start(&'static self) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        if self.state.get(&*lock) != ThreadState::Created {
            return Err(Errno::EINVAL);
        }
        if self.base_priority.get(&*lock) == IDLE_PRIORITY || self.stack_size == 0 {
            return Err(Errno::EINVAL);
        }

        let port = port::get();
        // Safety: the stack region comes from a `StackStorage` we exclusively
        // own from now on
        let sp = unsafe {
            (port.initialize_stack)(
                self.stack_base,
                self.stack_size,
                thread_start,
                self as *const ThreadCb as usize,
            )
        };
        self.stack_pointer.replace(&mut *lock, sp);
        self.quantum.replace(&mut *lock, ROUND_ROBIN_QUANTUM);
        self.state.replace(&mut *lock, ThreadState::Runnable);
        sched::state().runnable.insert_thread(lock.borrow_mut(), self);
        sched::maybe_request_context_switch(lock.borrow_mut());
        Ok(())
    }

    /// Wait until the thread terminates.
    ///
    /// # Errors
    ///
    /// - `EINVAL` - the thread was never started or is detached.
    /// - `EDEADLK` - a thread cannot join itself.
    /// - `EINTR` - the wait was interrupted by a signal.
    pub fn join(&'static self) -> Result<(), Errno> {
        loop {
            let lock = klock::lock_cpu()?;
            if self.detached.get(&*lock) {
                return Err(Errno::EINVAL);
            }
            match self.state.get(&*lock) {
                ThreadState::Terminated => return Ok(()),
                ThreadState::Created => return Err(Errno::EINVAL),
                _ => {}
            }
            if let Some(current) = sched::state().current.get(&*lock) {
                if ptr::eq(current, self) {
                    return Err(Errno::EDEADLK);
                }
            }
            sched::block_current(
                lock,
                &self.join_list,
                ThreadState::BlockedOnJoin,
                UnblockFunctor::NoOp,
                None,
            )?;
            // Re-check the state: an `UnblockRequest` may be spurious
        }
    }

    /// Give up the right to join the thread. A detached thread's control
    /// block may be reused once the thread terminates.
    pub fn detach(&'static self) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        if self.state.get(&*lock) == ThreadState::Created {
            return Err(Errno::EINVAL);
        }
        self.detached.replace(&mut *lock, true);
        Ok(())
    }

    /// Change the thread's base priority, repositioning it in whatever list
    /// currently holds it and propagating the change through any
    /// priority-inheritance chain it participates in.
    ///
    /// # Errors
    ///
    /// - `EINVAL` - `priority` is the idle priority, the thread is not
    ///   started or already terminated, or the new priority is above the
    ///   ceiling of a priority-protect mutex the thread holds or waits for.
    pub fn set_priority(&'static self, priority: Priority) -> Result<(), Errno> {
        if priority == IDLE_PRIORITY {
            return Err(Errno::EINVAL);
        }
        let mut lock = klock::lock_cpu()?;
        match self.state.get(&*lock) {
            ThreadState::Created | ThreadState::Terminated => return Err(Errno::EINVAL),
            _ => {}
        }
        let old = self.base_priority.get(&*lock);
        if old == priority {
            return Ok(());
        }
        // Raising the base priority must not violate the precondition of any
        // priority-protect mutex the thread is involved with
        if priority > old
            && (!mutex::held_mutexes_allow_base_priority(lock.borrow_mut(), self, priority)
                || !mutex::waited_mutex_allows_base_priority(lock.borrow_mut(), self, priority))
        {
            return Err(Errno::EINVAL);
        }
        self.base_priority.replace(&mut *lock, priority);
        let effective = mutex::evaluate_effective_priority(lock.borrow_mut(), self);
        sched::set_effective_priority(lock.borrow_mut(), self, effective);
        Ok(())
    }

    /// The thread's base priority.
    pub fn priority(&'static self) -> Result<Priority, Errno> {
        let lock = klock::lock_cpu()?;
        Ok(self.base_priority.get(&*lock))
    }

    /// The thread's effective priority, i.e. the base priority possibly
    /// elevated by a mutex locking protocol.
    pub fn effective_priority(&'static self) -> Result<Priority, Errno> {
        let lock = klock::lock_cpu()?;
        Ok(self.effective_priority.get(&*lock))
    }

    /// The thread's current state.
    pub fn state(&'static self) -> Result<ThreadState, Errno> {
        let lock = klock::lock_cpu()?;
        Ok(self.state.get(&*lock))
    }
}

/// Entry trampoline. The port arranges for the first context switch into a
/// new thread to begin executing this function with the thread's control
/// block address as the parameter.
pub(crate) fn thread_start(tcb_addr: usize) {
    // Safety: the parameter is the address of the `'static` ThreadCb that
    // `start` passed to `Port::initialize_stack`
    let tcb = unsafe { &*(tcb_addr as *const ThreadCb) };
    (tcb.entry)(tcb.param);
    exit();
}

/// Terminate the calling thread.
///
/// Mutexes held by the thread are abandoned: each is marked inconsistent and
/// handed to its next waiter, which observes `EOWNERDEAD`. All threads
/// joined on this thread are released.
pub fn exit() -> ! {
    let Ok(mut lock) = klock::lock_cpu() else {
        (port::get().fatal_error)("exit: no current thread context")
    };
    let state = sched::state();
    // Invariant: a current thread exists once the kernel is initialized
    let tcb = state.current.get(&*lock).unwrap();

    mutex::abandon_held_mutexes(lock.borrow_mut(), tcb);

    while let Some(joiner) = tcb.join_list.front(&*lock) {
        let _ = sched::unblock_locked(lock.borrow_mut(), joiner, UnblockReason::UnblockRequest);
    }
    debug_assert!(tcb.join_list.is_empty(&*lock));

    state.runnable.remove_thread(lock.borrow_mut(), tcb);
    tcb.state.replace(&mut *lock, ThreadState::Terminated);

    (port::get().request_context_switch)();
    drop(lock); // the final context switch happens as the mask clears
    (port::get().fatal_error)("terminated thread was rescheduled")
}

/// The idle thread. Owned by the kernel; always runnable; never blocks and
/// never exits.
pub(crate) static IDLE_STACK: StackStorage<IDLE_STACK_SIZE> = StackStorage::new();
pub(crate) static IDLE_THREAD: ThreadCb = ThreadCb::new(
    &IDLE_STACK,
    idle_main,
    0,
    IDLE_PRIORITY,
    SchedulingPolicy::Fifo,
);

fn idle_main(_: usize) {
    loop {
        (port::get().idle_hook)();
    }
}
