//! Simulator port of the Tern kernel for hosted environments.
//!
//! Each kernel thread is backed by an OS thread, but the port enforces the
//! target's execution model: exactly one kernel thread runs at any instant.
//! A thread only stops running when it performs a context switch itself,
//! which happens inside [`Port::interrupt_mask_restore`] when a pending
//! switch request is taken, exactly where a real port's switch exception
//! would fire. Everything else parks on a condition variable until it is
//! made current again.
//!
//! The tick interrupt is generated by a dedicated timer thread that fires
//! only while the system is quiescent (the idle thread is parked in its
//! idle hook and no switch is pending). Scenario tests therefore observe
//! deterministic tick counts and context-switch counts: ticks cannot race
//! running threads, mirroring a device that only leaves sleep on an
//! interrupt.
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, Once, OnceLock};
use std::thread;

use tern_kernel::{InterruptMask, Port, ThreadCb};

struct ThreadRec {
    entry: fn(usize),
    param: usize,
    started: bool,
}

#[derive(Default)]
struct Inner {
    /// The OS thread currently inside the interrupt mask, with its nesting
    /// depth. Models the hardware interrupt-disable state.
    mask_owner: Option<thread::ThreadId>,
    mask_depth: u32,
    /// A context switch was requested and fires at the next opportunity.
    switch_pending: bool,
    /// The stack-pointer key of the running kernel thread.
    current: Option<usize>,
    /// Kernel threads by stack-pointer key.
    threads: HashMap<usize, ThreadRec>,
    /// The idle thread is parked inside `idle_hook`.
    idle_waiting: bool,
    /// Remaining ticks the timer thread may deliver; `u64::MAX` means
    /// unlimited.
    tick_budget: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

static SHARED: OnceLock<Shared> = OnceLock::new();
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The stack-pointer key of the kernel thread backed by this OS thread.
    static MY_KEY: Cell<Option<usize>> = const { Cell::new(None) };
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

fn shared() -> &'static Shared {
    SHARED.get_or_init(|| Shared {
        inner: Mutex::new(Inner {
            tick_budget: u64::MAX,
            ..Inner::default()
        }),
        cond: Condvar::new(),
    })
}

fn lock() -> MutexGuard<'static, Inner> {
    shared().inner.lock().unwrap()
}

/// The port table to pass to [`tern_kernel::initialize`]. Prefer [`boot`],
/// which installs it and adopts the calling thread.
pub static PORT: Port = Port {
    interrupt_mask_set,
    interrupt_mask_restore,
    request_context_switch,
    initialize_stack,
    idle_hook,
    tick_now,
    is_interrupt_context,
    fatal_error,
};

/// Start the kernel on the simulator port, adopting the calling OS thread
/// as `main_thread` (a [`ThreadCb::new_main`] control block), and start the
/// tick source.
///
/// # Panics
///
/// Panics if the kernel rejects the configuration; the simulator is a test
/// vehicle and treats that as a harness bug.
pub fn boot(main_thread: &'static ThreadCb) {
    static ONCE: Once = Once::new();
    let _ = env_logger::builder().is_test(true).try_init();

    // Stack keys are aligned one-past-end addresses; tagging the main key
    // keeps it out of that space
    let main_key = main_thread as *const ThreadCb as usize | 1;
    tern_kernel::initialize(&PORT, main_thread).expect("kernel initialization failed");
    MY_KEY.with(|key| key.set(Some(main_key)));
    lock().current = Some(main_key);
    log::trace!("boot: main thread adopted with key {main_key:#x}");

    ONCE.call_once(|| {
        thread::Builder::new()
            .name("tern-tick".into())
            .spawn(tick_thread_main)
            .expect("failed to spawn the tick source");
    });
}

/// Limit the number of ticks the timer thread may still deliver. The
/// default is unlimited. Useful for asserting that something does *not*
/// happen within a bounded amount of simulated time.
pub fn set_tick_budget(budget: u64) {
    let mut guard = lock();
    guard.tick_budget = budget;
    drop(guard);
    shared().cond.notify_all();
}

fn interrupt_mask_set() -> InterruptMask {
    let me = thread::current().id();
    let mut guard = lock();
    while guard.mask_owner.map_or(false, |owner| owner != me) {
        guard = shared().cond.wait(guard).unwrap();
    }
    guard.mask_owner = Some(me);
    guard.mask_depth += 1;
    (guard.mask_depth - 1) as InterruptMask
}

fn interrupt_mask_restore(saved: InterruptMask) {
    let my_key = MY_KEY.with(|key| key.get());
    let mut dispatch_needed = false;
    {
        let mut guard = lock();
        debug_assert_eq!(guard.mask_depth as InterruptMask, saved + 1);
        guard.mask_depth -= 1;
        if guard.mask_depth == 0 {
            guard.mask_owner = None;
            // The switch exception fires once the mask fully clears, on the
            // running thread, outside interrupt context
            dispatch_needed = guard.switch_pending
                && my_key.is_some()
                && guard.current == my_key
                && !IN_INTERRUPT.with(|flag| flag.get())
                && !IN_DISPATCH.with(|flag| flag.get());
        }
        shared().cond.notify_all();
    }
    if dispatch_needed {
        dispatch(my_key.unwrap());
    }
}

fn request_context_switch() {
    let mut guard = lock();
    guard.switch_pending = true;
    drop(guard);
    shared().cond.notify_all();
}

/// Perform the context switch on behalf of the calling kernel thread, then
/// wait until this thread is scheduled again.
fn dispatch(my_key: usize) {
    IN_DISPATCH.with(|flag| flag.set(true));
    {
        let mut guard = lock();
        if !guard.switch_pending {
            IN_DISPATCH.with(|flag| flag.set(false));
            return;
        }
        guard.switch_pending = false;
    }

    let new_key = tern_kernel::switch_context(my_key);
    log::trace!("dispatch: {my_key:#x} -> {new_key:#x}");

    let mut guard = lock();
    guard.current = Some(new_key);
    spawn_if_needed(&mut guard, new_key);
    shared().cond.notify_all();
    while guard.current != Some(my_key) {
        guard = shared().cond.wait(guard).unwrap();
    }
    drop(guard);
    IN_DISPATCH.with(|flag| flag.set(false));
}

fn spawn_if_needed(inner: &mut Inner, key: usize) {
    if let Some(rec) = inner.threads.get_mut(&key) {
        if !rec.started {
            rec.started = true;
            let entry = rec.entry;
            let param = rec.param;
            thread::Builder::new()
                .name(format!("tern-{key:#x}"))
                .spawn(move || kernel_thread_main(key, entry, param))
                .expect("failed to spawn a kernel thread");
        }
    }
}

fn kernel_thread_main(key: usize, entry: fn(usize), param: usize) {
    MY_KEY.with(|cell| cell.set(Some(key)));
    {
        let mut guard = lock();
        while guard.current != Some(key) {
            guard = shared().cond.wait(guard).unwrap();
        }
    }
    log::trace!("thread {key:#x} entering");
    // `entry` is the kernel's start trampoline; thread exit never returns
    // through it
    entry(param);
    unreachable!("a kernel thread returned from its trampoline");
}

unsafe fn initialize_stack(base: *mut u8, size: usize, entry: fn(usize), param: usize) -> usize {
    // The key doubles as the fake stack pointer; keeping it at the top of
    // the stack region satisfies the kernel's bounds check.
    let key = base as usize + size;
    let mut guard = lock();
    guard.threads.insert(
        key,
        ThreadRec {
            entry,
            param,
            started: false,
        },
    );
    key
}

fn idle_hook() {
    {
        let mut guard = lock();
        guard.idle_waiting = true;
        shared().cond.notify_all(); // the tick source watches for quiescence
        while !guard.switch_pending {
            guard = shared().cond.wait(guard).unwrap();
        }
        guard.idle_waiting = false;
    }
    let my_key = MY_KEY.with(|key| key.get()).unwrap();
    dispatch(my_key);
}

fn tick_now() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

fn is_interrupt_context() -> bool {
    IN_INTERRUPT.with(|flag| flag.get())
}

fn fatal_error(message: &'static str) -> ! {
    panic!("kernel fatal error: {message}");
}

/// Deliver tick interrupts whenever the system is quiescent: the idle
/// thread is parked in its hook, no switch is pending, and nothing holds
/// the interrupt mask. This models a processor that sleeps until the next
/// timer interrupt.
fn tick_thread_main() {
    loop {
        {
            let mut guard = lock();
            loop {
                let quiescent = guard.idle_waiting
                    && !guard.switch_pending
                    && guard.mask_depth == 0
                    && guard.tick_budget > 0;
                if quiescent {
                    break;
                }
                guard = shared().cond.wait(guard).unwrap();
            }
            if guard.tick_budget != u64::MAX {
                guard.tick_budget -= 1;
            }
        }
        IN_INTERRUPT.with(|flag| flag.set(true));
        TICK_COUNT.fetch_add(1, Ordering::Relaxed);
        let switch_required = tern_kernel::tick_interrupt_handler();
        IN_INTERRUPT.with(|flag| flag.set(false));
        log::trace!(
            "tick {} delivered, switch_required = {switch_required}",
            TICK_COUNT.load(Ordering::Relaxed)
        );
    }
}
