//! Advisory whole-file locks via `flock(2)`.
//!
//! Locks belong to the open file description behind a descriptor, not to the
//! descriptor number or the process: two independent `open`s of the same
//! path conflict with each other even inside one process, while descriptors
//! duplicated with `dup` or inherited across `fork` share a single lock.
//!
//! Nothing here owns the descriptor. Closing it elsewhere releases the lock
//! and makes later calls fail with `EBADF`.

use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{ErrnoError, Result};

/// Which lock to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Any number of holders; conflicts only with exclusive locks.
    Shared,
    /// Single holder; conflicts with every other lock.
    Exclusive,
}

/// Whether a lock request may suspend the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    /// Wait until the lock is granted.
    Block,
    /// Return immediately if a conflicting lock is held.
    NonBlock,
}

/// Request a lock on `fd`.
///
/// Returns `Ok(true)` once the lock is held. With [`Blocking::NonBlock`],
/// returns `Ok(false)` instead of waiting when another open file description
/// holds a conflicting lock. A descriptor that already holds a lock is
/// converted in place (shared to exclusive or back).
pub fn lock(fd: RawFd, kind: LockKind, blocking: Blocking) -> Result<bool> {
    let mut operation = match kind {
        LockKind::Shared => libc::LOCK_SH,
        LockKind::Exclusive => libc::LOCK_EX,
    };
    if blocking == Blocking::NonBlock {
        operation |= libc::LOCK_NB;
    }

    loop {
        // SAFETY: flock only inspects the descriptor number; an invalid fd is
        // reported through errno.
        if unsafe { libc::flock(fd, operation) } == 0 {
            tracing::trace!(fd, ?kind, ?blocking, "flock granted");
            return Ok(true);
        }
        let err = ErrnoError::last("flock");
        match err.errno() {
            libc::EINTR => continue,
            libc::EWOULDBLOCK if blocking == Blocking::NonBlock => return Ok(false),
            _ => return Err(err),
        }
    }
}

/// Take a shared lock, blocking until granted.
pub fn share(fd: RawFd) -> Result<()> {
    lock(fd, LockKind::Shared, Blocking::Block).map(drop)
}

/// Try to take a shared lock without blocking.
pub fn try_share(fd: RawFd) -> Result<bool> {
    lock(fd, LockKind::Shared, Blocking::NonBlock)
}

/// Take an exclusive lock, blocking until granted.
pub fn exclusive(fd: RawFd) -> Result<()> {
    lock(fd, LockKind::Exclusive, Blocking::Block).map(drop)
}

/// Try to take an exclusive lock without blocking.
pub fn try_exclusive(fd: RawFd) -> Result<bool> {
    lock(fd, LockKind::Exclusive, Blocking::NonBlock)
}

/// Release whatever lock `fd` holds.
///
/// Unlocking a descriptor that holds no lock succeeds.
pub fn unlock(fd: RawFd) -> Result<()> {
    loop {
        // SAFETY: see `lock`.
        if unsafe { libc::flock(fd, libc::LOCK_UN) } == 0 {
            tracing::trace!(fd, "flock released");
            return Ok(());
        }
        let err = ErrnoError::last("flock");
        if err.errno() != libc::EINTR {
            return Err(err);
        }
    }
}

/// `flock` methods for anything that exposes a raw descriptor.
///
/// The names avoid colliding with `std::fs::File::lock` and friends.
pub trait FileLockExt: AsRawFd {
    fn flock_share(&self) -> Result<()> {
        share(self.as_raw_fd())
    }

    fn try_flock_share(&self) -> Result<bool> {
        try_share(self.as_raw_fd())
    }

    fn flock_exclusive(&self) -> Result<()> {
        exclusive(self.as_raw_fd())
    }

    fn try_flock_exclusive(&self) -> Result<bool> {
        try_exclusive(self.as_raw_fd())
    }

    fn flock_unlock(&self) -> Result<()> {
        unlock(self.as_raw_fd())
    }
}

impl<T: AsRawFd + ?Sized> FileLockExt for T {}
