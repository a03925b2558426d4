//! Error codes
use core::fmt;

/// All error codes that the kernel can return.
///
/// The values are intentionally matched to their newlib `errno` equivalents
/// so that a C wrapper can return them verbatim.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(clippy::upper_case_acronyms)]
#[repr(u8)]
pub enum Errno {
    /// The caller does not have permission to perform the operation, or the
    /// current context disallows it (e.g. a blocking call made from an
    /// interrupt handler).
    EPERM = 1,
    /// A blocking operation was interrupted by a signal.
    EINTR = 4,
    /// The operation would have to block or overflow a counter, and the
    /// caller asked not to block.
    EAGAIN = 11,
    /// A bounded buffer could not be attached.
    ENOMEM = 12,
    /// The resource is held by another thread.
    EBUSY = 16,
    /// A parameter is invalid or a target object is in a state that
    /// disallows the operation.
    EINVAL = 22,
    /// Completing the operation would lead to a resource deadlock.
    EDEADLK = 45,
    /// The operation's deadline passed before it could complete.
    ETIMEDOUT = 116,
    /// A message size does not match the queue's element size.
    EMSGSIZE = 122,
    /// The previous owner of a mutex exited while holding the lock.
    EOWNERDEAD = 133,
}

impl Errno {
    /// Get the short name of the error code.
    ///
    /// # Examples
    ///
    /// ```
    /// use tern_kernel::Errno;
    /// assert_eq!(Errno::ETIMEDOUT.as_str(), "ETIMEDOUT");
    /// ```
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EPERM => "EPERM",
            Self::EINTR => "EINTR",
            Self::EAGAIN => "EAGAIN",
            Self::ENOMEM => "ENOMEM",
            Self::EBUSY => "EBUSY",
            Self::EINVAL => "EINVAL",
            Self::EDEADLK => "EDEADLK",
            Self::ETIMEDOUT => "ETIMEDOUT",
            Self::EMSGSIZE => "EMSGSIZE",
            Self::EOWNERDEAD => "EOWNERDEAD",
        }
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_newlib() {
        assert_eq!(Errno::EPERM as u8, 1);
        assert_eq!(Errno::EINTR as u8, 4);
        assert_eq!(Errno::EAGAIN as u8, 11);
        assert_eq!(Errno::ENOMEM as u8, 12);
        assert_eq!(Errno::EBUSY as u8, 16);
        assert_eq!(Errno::EINVAL as u8, 22);
        assert_eq!(Errno::EDEADLK as u8, 45);
        assert_eq!(Errno::ETIMEDOUT as u8, 116);
        assert_eq!(Errno::EMSGSIZE as u8, 122);
        assert_eq!(Errno::EOWNERDEAD as u8, 133);
    }
}
