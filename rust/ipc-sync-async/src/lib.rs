//! Tokio adapters for [`ipc_sync`].
//!
//! Semaphore waits and `flock` requests block the calling thread, which must
//! not be a runtime worker. The functions here move the call onto tokio's
//! blocking pool and await it.
//!
//! Dropping one of these futures does not cancel the underlying call: a wait
//! keeps running on the pool and still consumes a unit once it is granted.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use ipc_sync::{CountingSemaphore, ErrnoError, flock};

/// Error from an adapted call.
#[derive(Debug, thiserror::Error)]
pub enum AsyncError {
    #[error(transparent)]
    Errno(#[from] ErrnoError),

    /// The blocking task panicked or the runtime shut down under it.
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = AsyncError> = std::result::Result<T, E>;

async fn run_blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> ipc_sync::Result<T> + Send + 'static,
{
    tracing::trace!(what, "dispatching to blocking pool");
    Ok(tokio::task::spawn_blocking(f).await??)
}

/// [`CountingSemaphore::wait`] on the blocking pool.
pub async fn wait<S: CountingSemaphore + 'static>(sem: Arc<S>) -> Result<()> {
    run_blocking("wait", move || sem.wait()).await
}

/// [`CountingSemaphore::trywait`] on the blocking pool.
pub async fn trywait<S: CountingSemaphore + 'static>(sem: Arc<S>) -> Result<bool> {
    run_blocking("trywait", move || sem.trywait()).await
}

/// [`CountingSemaphore::post`] on the blocking pool.
pub async fn post<S: CountingSemaphore + 'static>(sem: Arc<S>) -> Result<()> {
    run_blocking("post", move || sem.post()).await
}

/// Blocking shared `flock` on the blocking pool.
pub async fn share<F: AsRawFd + Send + Sync + 'static>(file: Arc<F>) -> Result<()> {
    run_blocking("flock share", move || flock::share(file.as_raw_fd())).await
}

/// Blocking exclusive `flock` on the blocking pool.
pub async fn exclusive<F: AsRawFd + Send + Sync + 'static>(file: Arc<F>) -> Result<()> {
    run_blocking("flock exclusive", move || flock::exclusive(file.as_raw_fd())).await
}
