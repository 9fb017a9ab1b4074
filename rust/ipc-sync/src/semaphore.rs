use crate::error::Result;

/// Operations shared by every counting semaphore handle in this crate.
///
/// Implementations are `Send + Sync`: waiting, posting and probing take
/// `&self`, so one handle can be shared between threads. Closing needs
/// exclusive access and therefore lives on the concrete types.
pub trait CountingSemaphore: Send + Sync {
    /// Decrement, blocking the calling thread while the count is zero.
    fn wait(&self) -> Result<()>;

    /// Decrement if the count is positive. Never blocks.
    ///
    /// Returns `false`, leaving the count untouched, when it was zero.
    fn trywait(&self) -> Result<bool>;

    /// Increment, waking one blocked waiter if there is one.
    fn post(&self) -> Result<()>;
}
