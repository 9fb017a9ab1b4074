//! Forked-child helpers shared by the cross-process tests.

#![allow(dead_code)]

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use ipc_sync::{Mode, PosixSemaphore};

/// A forked child process, reaped on drop.
pub struct Child {
    pid: libc::pid_t,
    reaped: bool,
}

/// Fork and run `body` in the child. The child exits with the code `body`
/// returns, or 101 if it panics; destructors of the parent's state do not
/// run in the child.
pub fn fork(body: impl FnOnce() -> i32) -> Child {
    // SAFETY: the child only runs `body` and then `_exit`s, never returning
    // into the test harness.
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed"),
        0 => {
            let code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(101);
            // SAFETY: _exit never returns; skipping destructors and atexit
            // handlers keeps the parent's state untouched.
            unsafe { libc::_exit(code) };
        }
        pid => Child { pid, reaped: false },
    }
}

impl Child {
    /// Block until the child exits and return its exit code.
    pub fn wait(mut self) -> i32 {
        let mut status: i32 = 0;
        // SAFETY: status is a valid out-pointer; pid is our unreaped child.
        let rc = unsafe { libc::waitpid(self.pid, &mut status, 0) };
        assert_eq!(rc, self.pid, "waitpid failed");
        self.reaped = true;
        assert!(libc::WIFEXITED(status), "child did not exit normally");
        libc::WEXITSTATUS(status)
    }

    /// Whether the child is still running.
    pub fn is_running(&mut self) -> bool {
        let mut status: i32 = 0;
        // SAFETY: as in `wait`.
        match unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) } {
            0 => true,
            _ => {
                self.reaped = true;
                false
            }
        }
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if !self.reaped {
            // SAFETY: pid is our own child and has not been reaped, so it
            // cannot name another process; a null status is allowed.
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
                libc::waitpid(self.pid, std::ptr::null_mut(), 0);
            }
        }
    }
}

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Exit code for a child-side check.
pub fn check(ok: bool) -> i32 {
    if ok { 0 } else { 1 }
}

/// A uniquely named POSIX semaphore, unlinked on drop.
pub struct Named {
    pub name: String,
}

impl Named {
    pub fn new(tag: &str) -> Self {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "/ist-{tag}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let _ = PosixSemaphore::unlink(&name);
        Self { name }
    }

    pub fn create(&self, value: u32) -> PosixSemaphore {
        PosixSemaphore::create_exclusive(&self.name, Mode::USER_RW, value).unwrap()
    }
}

impl Drop for Named {
    fn drop(&mut self) {
        let _ = PosixSemaphore::unlink(&self.name);
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
