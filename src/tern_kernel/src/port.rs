//! The Port interface - the architecture primitives the kernel depends on.
//!
//! A port is a plain table of function pointers installed exactly once at
//! boot. There is no trait object and no generic parameter; the kernel is a
//! process-wide singleton and so is its port.
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::error::Errno;

/// An opaque token returned by [`Port::interrupt_mask_set`] and consumed by
/// [`Port::interrupt_mask_restore`]. Ports are free to store the previous
/// mask state in it; the kernel never inspects it.
pub type InterruptMask = usize;

/// The architecture adapter layer.
///
/// Every field is set once by the port before [`crate::initialize`] and never
/// changes afterwards. All functions must be callable from any context unless
/// noted otherwise.
pub struct Port {
    /// Mask maskable interrupts up to the kernel ceiling. Nests; each call
    /// must be paired with [`Self::interrupt_mask_restore`] receiving the
    /// returned token.
    pub interrupt_mask_set: fn() -> InterruptMask,

    /// Undo one level of [`Self::interrupt_mask_set`].
    pub interrupt_mask_restore: fn(InterruptMask),

    /// Pend the lowest-priority architected exception. When the exception is
    /// taken (at the latest, when the interrupt mask is fully cleared), the
    /// port must call [`crate::switch_context`] and resume execution on the
    /// returned stack pointer.
    pub request_context_switch: fn(),

    /// Prepare a new stack so that the first context switch into it begins
    /// executing `entry(param)`. Returns the initial stack pointer.
    ///
    /// # Safety
    ///
    /// `base .. base + size` must be valid, writable, exclusively-owned
    /// memory.
    pub initialize_stack: unsafe fn(base: *mut u8, size: usize, entry: fn(usize), param: usize) -> usize,

    /// Processor-specific low-power wait, called by the idle thread in a
    /// loop. May return at any time.
    pub idle_hook: fn(),

    /// Read the monotonic tick count as a single atomic word.
    ///
    /// The value must equal the number of tick interrupts delivered to
    /// [`crate::tick_interrupt_handler`] so far.
    pub tick_now: fn() -> u64,

    /// Return `true` when called from an interrupt handler.
    pub is_interrupt_context: fn() -> bool,

    /// Halt the kernel after a fatal invariant violation. This is the only
    /// non-recoverable path out of the kernel.
    pub fatal_error: fn(&'static str) -> !,
}

static PORT: AtomicPtr<Port> = AtomicPtr::new(ptr::null_mut());

/// Install the port table. Fails with `EPERM` if a port is already
/// installed.
pub(crate) fn install(port: &'static Port) -> Result<(), Errno> {
    PORT.compare_exchange(
        ptr::null_mut(),
        port as *const Port as *mut Port,
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .map(|_| ())
    .map_err(|_| Errno::EPERM)
}

/// Get the installed port table, or `None` before boot.
#[inline]
pub(crate) fn try_get() -> Option<&'static Port> {
    let ptr = PORT.load(Ordering::Acquire);
    // Safety: the pointer was derived from a `&'static Port` in `install`
    unsafe { ptr.cast_const().as_ref() }
}

/// Get the installed port table.
///
/// Must only be called on paths that have already observed an installed port
/// (everything downstream of a successful [`crate::klock::lock_cpu`]). If the
/// invariant is somehow broken there is no port to report the fatal error
/// through, so the kernel parks the processor instead of panicking.
#[inline]
pub(crate) fn get() -> &'static Port {
    match try_get() {
        Some(port) => port,
        None => loop {
            core::hint::spin_loop();
        },
    }
}
