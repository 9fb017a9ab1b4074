//! POSIX named semaphores (`sem_open(3)`).
//!
//! A named semaphore lives in a system-wide namespace until it is unlinked.
//! Closing a handle only detaches this process; the count and the name
//! survive for other processes (and for later opens) until [`PosixSemaphore::unlink`].
//!
//! Names follow the platform rules: a leading `/` followed by up to
//! `NAME_MAX - 4` characters and no further slashes is portable.

use std::ffi::CString;
use std::ptr::NonNull;

use libc::c_int;

use crate::error::{ErrnoError, Result};
use crate::mode::Mode;
use crate::semaphore::CountingSemaphore;

/// errno reported for operations on a closed handle.
///
/// Matches what the platform's own `sem_*` calls report for an invalid
/// semaphore pointer: Apple's libc says `EBADF`, glibc and musl say `EINVAL`.
#[cfg(target_vendor = "apple")]
pub const CLOSED_HANDLE_ERRNO: c_int = libc::EBADF;
#[cfg(not(target_vendor = "apple"))]
pub const CLOSED_HANDLE_ERRNO: c_int = libc::EINVAL;

/// One process's attachment to a named semaphore.
///
/// Dropping an open handle closes it.
#[derive(Debug)]
pub struct PosixSemaphore {
    sem: Option<NonNull<libc::sem_t>>,
    name: String,
}

// SAFETY: the sem_* functions are thread-safe on a valid sem_t, and the
// pointer is only invalidated by `close`, which takes `&mut self`.
unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl PosixSemaphore {
    /// Attach to an existing semaphore. Fails `ENOENT` if `name` is absent.
    pub fn open(name: &str) -> Result<Self> {
        Self::sem_open(name, 0, Mode::empty(), 0)
    }

    /// Attach to `name`, creating it with `mode` and `value` if absent.
    ///
    /// When the semaphore already exists, `mode` and `value` are ignored and
    /// its current count is kept.
    pub fn create(name: &str, mode: Mode, value: u32) -> Result<Self> {
        Self::sem_open(name, libc::O_CREAT, mode, value)
    }

    /// Create `name`, failing `EEXIST` if it already exists.
    pub fn create_exclusive(name: &str, mode: Mode, value: u32) -> Result<Self> {
        Self::sem_open(name, libc::O_CREAT | libc::O_EXCL, mode, value)
    }

    /// Same as [`PosixSemaphore::create`]; mirrors the System V naming.
    pub fn create_shared(name: &str, mode: Mode, value: u32) -> Result<Self> {
        Self::create(name, mode, value)
    }

    /// Remove `name` from the namespace. Fails `ENOENT` if it is absent.
    ///
    /// Handles that are already open keep working until they are closed.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = c_name("sem_unlink", name)?;
        // SAFETY: c_name is NUL-terminated and outlives the call.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == -1 {
            return Err(ErrnoError::last("sem_unlink").with_extra(name));
        }
        tracing::debug!(name, "unlinked posix semaphore");
        Ok(())
    }

    fn sem_open(name: &str, oflag: c_int, mode: Mode, value: u32) -> Result<Self> {
        let c_name = c_name("sem_open", name)?;
        loop {
            // SAFETY: c_name is NUL-terminated; the variadic mode and value are
            // only read when O_CREAT is set, and are passed promoted to
            // unsigned int as sem_open expects.
            let sem = unsafe {
                if oflag & libc::O_CREAT != 0 {
                    libc::sem_open(
                        c_name.as_ptr(),
                        oflag,
                        mode.permissions() as libc::c_uint,
                        value as libc::c_uint,
                    )
                } else {
                    libc::sem_open(c_name.as_ptr(), oflag)
                }
            };
            if sem != libc::SEM_FAILED
                && let Some(sem) = NonNull::new(sem)
            {
                tracing::debug!(name, oflag, "opened posix semaphore");
                return Ok(Self {
                    sem: Some(sem),
                    name: name.to_owned(),
                });
            }
            let err = ErrnoError::last("sem_open");
            if err.errno() != libc::EINTR {
                return Err(err.with_extra(name));
            }
        }
    }

    /// The name this handle was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`PosixSemaphore::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.sem.is_none()
    }

    fn handle(&self, syscall: &'static str) -> Result<*mut libc::sem_t> {
        match self.sem {
            Some(sem) => Ok(sem.as_ptr()),
            None => Err(ErrnoError::new(syscall, CLOSED_HANDLE_ERRNO).with_extra(&self.name)),
        }
    }

    /// Decrement, blocking while the count is zero.
    pub fn wait(&self) -> Result<()> {
        let sem = self.handle("sem_wait")?;
        loop {
            // SAFETY: sem stays valid until close, which needs &mut self.
            if unsafe { libc::sem_wait(sem) } == 0 {
                return Ok(());
            }
            let err = ErrnoError::last("sem_wait");
            if err.errno() != libc::EINTR {
                return Err(err.with_extra(&self.name));
            }
        }
    }

    /// Decrement if positive; `false` if the count was zero.
    pub fn trywait(&self) -> Result<bool> {
        let sem = self.handle("sem_trywait")?;
        loop {
            // SAFETY: as in `wait`.
            if unsafe { libc::sem_trywait(sem) } == 0 {
                return Ok(true);
            }
            let err = ErrnoError::last("sem_trywait");
            match err.errno() {
                libc::EAGAIN => return Ok(false),
                libc::EINTR => continue,
                _ => return Err(err.with_extra(&self.name)),
            }
        }
    }

    /// Increment the count.
    pub fn post(&self) -> Result<()> {
        let sem = self.handle("sem_post")?;
        // SAFETY: as in `wait`.
        if unsafe { libc::sem_post(sem) } == -1 {
            return Err(ErrnoError::last("sem_post").with_extra(&self.name));
        }
        Ok(())
    }

    /// Current count.
    ///
    /// Only available where `sem_getvalue` is implemented; Apple platforms
    /// ship it as a stub that fails `ENOSYS`.
    #[cfg(not(target_vendor = "apple"))]
    pub fn value(&self) -> Result<u32> {
        let sem = self.handle("sem_getvalue")?;
        let mut value: c_int = 0;
        // SAFETY: as in `wait`; value is a valid out-pointer.
        if unsafe { libc::sem_getvalue(sem, &mut value) } == -1 {
            return Err(ErrnoError::last("sem_getvalue").with_extra(&self.name));
        }
        // Linux reports 0 rather than a negative waiter count.
        Ok(value.max(0) as u32)
    }

    /// Detach from the semaphore without removing it.
    ///
    /// A second call fails with [`CLOSED_HANDLE_ERRNO`], as does every other
    /// operation on a closed handle.
    pub fn close(&mut self) -> Result<()> {
        let sem = self.handle("sem_close")?;
        self.sem = None;
        // SAFETY: sem came from sem_open and has not been closed; it is
        // cleared above so it is never used again.
        if unsafe { libc::sem_close(sem) } == -1 {
            return Err(ErrnoError::last("sem_close").with_extra(&self.name));
        }
        tracing::debug!(name = %self.name, "closed posix semaphore");
        Ok(())
    }
}

impl CountingSemaphore for PosixSemaphore {
    fn wait(&self) -> Result<()> {
        PosixSemaphore::wait(self)
    }

    fn trywait(&self) -> Result<bool> {
        PosixSemaphore::trywait(self)
    }

    fn post(&self) -> Result<()> {
        PosixSemaphore::post(self)
    }
}

impl Drop for PosixSemaphore {
    fn drop(&mut self) {
        if self.sem.is_some()
            && let Err(err) = self.close()
        {
            tracing::warn!(
                name = %self.name,
                error = %err,
                "failed to close posix semaphore on drop"
            );
        }
    }
}

fn c_name(syscall: &'static str, name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| ErrnoError::new(syscall, libc::EINVAL).with_extra(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "/is-{tag}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Unlinks the name when the test ends, pass or fail.
    struct Unlink(String);

    impl Drop for Unlink {
        fn drop(&mut self) {
            let _ = PosixSemaphore::unlink(&self.0);
        }
    }

    #[test]
    fn unlink_missing_is_enoent() {
        let name = unique_name("unl");
        let err = PosixSemaphore::unlink(&name).unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        assert_eq!(err.syscall(), "sem_unlink");
    }

    #[test]
    fn open_missing_is_enoent() {
        let name = unique_name("opn");
        let err = PosixSemaphore::open(&name).unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        assert_eq!(err.syscall(), "sem_open");
    }

    #[test]
    fn create_exclusive_then_exists() {
        let name = unique_name("excl");
        let _cleanup = Unlink(name.clone());
        let _sem = PosixSemaphore::create_exclusive(&name, Mode::USER_RW, 1).unwrap();
        let err = PosixSemaphore::create_exclusive(&name, Mode::USER_RW, 1).unwrap_err();
        assert_eq!(err.code(), "EEXIST");
        assert!(err.is_exists());
    }

    #[test]
    fn create_opens_existing_without_resetting() {
        let name = unique_name("create");
        let _cleanup = Unlink(name.clone());
        let first = PosixSemaphore::create(&name, Mode::USER_RW, 1).unwrap();
        assert!(first.trywait().unwrap());
        let second = PosixSemaphore::create_shared(&name, Mode::USER_RW, 5).unwrap();
        assert!(!second.trywait().unwrap());
        let third = PosixSemaphore::open(&name).unwrap();
        third.post().unwrap();
        assert!(first.trywait().unwrap());
    }

    #[test]
    fn wait_post_trywait_sequence() {
        let name = unique_name("ops");
        let _cleanup = Unlink(name.clone());
        let sem = PosixSemaphore::create(&name, Mode::USER_RW, 1).unwrap();
        sem.wait().unwrap();
        sem.post().unwrap();
        assert!(sem.trywait().unwrap());
        assert!(!sem.trywait().unwrap());
        sem.post().unwrap();
    }

    #[cfg(not(target_vendor = "apple"))]
    #[test]
    fn value_tracks_count() {
        let name = unique_name("value");
        let _cleanup = Unlink(name.clone());
        let sem = PosixSemaphore::create(&name, Mode::USER_RW, 3).unwrap();
        assert_eq!(sem.value().unwrap(), 3);
        assert!(sem.trywait().unwrap());
        assert_eq!(sem.value().unwrap(), 2);
        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 4);
    }

    #[test]
    fn operations_after_close_fail() {
        let name = unique_name("closed");
        let _cleanup = Unlink(name.clone());
        let mut sem = PosixSemaphore::create(&name, Mode::USER_RW, 1).unwrap();
        sem.close().unwrap();
        assert!(sem.is_closed());

        let wait = sem.wait().unwrap_err();
        assert_eq!((wait.syscall(), wait.errno()), ("sem_wait", CLOSED_HANDLE_ERRNO));
        let trywait = sem.trywait().unwrap_err();
        assert_eq!(trywait.syscall(), "sem_trywait");
        let post = sem.post().unwrap_err();
        assert_eq!(post.syscall(), "sem_post");
        let close = sem.close().unwrap_err();
        assert_eq!((close.syscall(), close.errno()), ("sem_close", CLOSED_HANDLE_ERRNO));
        assert!(close.is_bad_handle());
    }

    #[test]
    fn close_keeps_the_semaphore() {
        let name = unique_name("keep");
        let _cleanup = Unlink(name.clone());
        let mut sem = PosixSemaphore::create(&name, Mode::USER_RW, 2).unwrap();
        assert!(sem.trywait().unwrap());
        sem.close().unwrap();

        let again = PosixSemaphore::open(&name).unwrap();
        assert!(again.trywait().unwrap());
        assert!(!again.trywait().unwrap());
    }

    #[test]
    fn unlinked_handles_remain_usable() {
        let name = unique_name("gone");
        let sem = PosixSemaphore::create(&name, Mode::USER_RW, 0).unwrap();
        PosixSemaphore::unlink(&name).unwrap();
        sem.post().unwrap();
        assert!(sem.trywait().unwrap());
        assert_eq!(PosixSemaphore::open(&name).unwrap_err().code(), "ENOENT");
    }

    #[test]
    fn interior_nul_is_einval() {
        let err = PosixSemaphore::open("/bad\0name").unwrap_err();
        assert_eq!(err.code(), "EINVAL");
        assert_eq!(err.syscall(), "sem_open");
    }

    #[test]
    fn wait_returns_after_post_from_another_thread() {
        let name = unique_name("thr");
        let _cleanup = Unlink(name.clone());
        let sem = std::sync::Arc::new(PosixSemaphore::create(&name, Mode::USER_RW, 0).unwrap());
        let poster = {
            let sem = sem.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                sem.post().unwrap();
            })
        };
        sem.wait().unwrap();
        poster.join().unwrap();
    }
}
