//! Kernel state locking mechanism.
//!
//! Every piece of kernel-global mutable state lives in a [`CpuLockCell`],
//! which can only be accessed through a [`CpuLockToken`]. The token is
//! materialized by [`lock_cpu`], which masks interrupts through the Port and
//! hands out an RAII guard. Since the kernel is single-core and interrupts
//! are masked while the token exists, holding the token proves exclusive
//! access.
use core::ops;
use core::sync::atomic::{AtomicBool, Ordering};
use tokenlock::UnsyncTokenLock;

use crate::error::Errno;
use crate::port::{self, InterruptMask};
use crate::utils::Init;

pub(crate) struct CpuLockTag;

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken = tokenlock::UnsyncSingletonToken<CpuLockTag>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole = tokenlock::SingletonTokenId<CpuLockTag>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(crate) struct CpuLockCell<T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole>);

impl<T> CpuLockCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<T: Init> Init for CpuLockCell<T> {
    const INIT: Self = Self(Init::INIT);
}

impl<T: ?Sized> ops::Deref for CpuLockCell<T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: ?Sized> ops::DerefMut for CpuLockCell<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Tracks whether a [`CpuLockGuard`] currently exists. Mutated only while
/// interrupts are masked, so plain swap/store suffice.
static CPU_LOCK_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Attempt to enter a CPU Lock state and get an RAII guard.
///
/// Returns `EPERM` if no port is installed yet or if the kernel is already
/// in a CPU Lock state.
pub(crate) fn lock_cpu() -> Result<CpuLockGuard, Errno> {
    let port = port::try_get().ok_or(Errno::EPERM)?;
    let saved = (port.interrupt_mask_set)();
    if CPU_LOCK_ACTIVE.swap(true, Ordering::Acquire) {
        (port.interrupt_mask_restore)(saved);
        return Err(Errno::EPERM);
    }
    // Safety: we just entered a CPU Lock state, so there are no other
    // instances of `CpuLockToken` at this point
    Ok(CpuLockGuard {
        token: unsafe { CpuLockToken::new_unchecked() },
        saved,
    })
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type. Dropping the guard
/// restores the interrupt mask; on ports with a pending context-switch
/// request, the switch happens at that moment.
pub(crate) struct CpuLockGuard {
    token: CpuLockToken,
    saved: InterruptMask,
}

impl CpuLockGuard {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_> {
        self.token.borrow_mut()
    }
}

impl Drop for CpuLockGuard {
    fn drop(&mut self) {
        CPU_LOCK_ACTIVE.store(false, Ordering::Release);
        (port::get().interrupt_mask_restore)(self.saved);
    }
}

impl ops::Deref for CpuLockGuard {
    type Target = CpuLockToken;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl ops::DerefMut for CpuLockGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
///
/// When passing this to a function, re-borrow manually with
/// [`tokenlock::UnsyncSingletonTokenRefMut::borrow_mut`] so that the
/// original remains accessible after the call.
pub(crate) type CpuLockTokenRefMut<'a> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag>;
