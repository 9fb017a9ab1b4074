//! Permission bits for newly created semaphores.

use bitflags::bitflags;

bitflags! {
    /// POSIX permission bits (`chmod` style) applied when a create call
    /// brings a new named object into existence.
    ///
    /// Only the low nine bits are meaningful to System V sets; POSIX named
    /// semaphores are additionally filtered by the process umask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Mode: u32 {
        const USER_READ   = 0o400;
        const USER_WRITE  = 0o200;
        const USER_EXEC   = 0o100;
        const USER_ALL    = 0o700;

        const GROUP_READ  = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC  = 0o010;
        const GROUP_ALL   = 0o070;

        const OTHER_READ  = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_EXEC  = 0o001;
        const OTHER_ALL   = 0o007;

        const SET_UID     = 0o4000;
        const SET_GID     = 0o2000;
        const STICKY      = 0o1000;
    }
}

impl Mode {
    /// Owner read/write (`0o600`).
    pub const USER_RW: Mode = Mode::USER_READ.union(Mode::USER_WRITE);

    /// Build from an octal literal, dropping bits that are not permissions.
    pub const fn from_octal(bits: u32) -> Mode {
        Mode::from_bits_truncate(bits)
    }

    /// The nine `rwx` bits, without setuid/setgid/sticky.
    pub const fn permissions(self) -> u32 {
        self.bits() & 0o777
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::USER_RW
    }
}

impl From<u32> for Mode {
    fn from(bits: u32) -> Self {
        Mode::from_bits_truncate(bits)
    }
}
