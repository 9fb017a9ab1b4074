#![doc = include_str!("../README.md")]
#![cfg(unix)]

pub mod error;
pub mod flock;
pub mod mode;
pub mod posix;
pub mod semaphore;
pub mod sysv;
pub mod token;

pub use error::{ErrnoError, Result};
pub use flock::{Blocking, FileLockExt, LockKind};
pub use mode::Mode;
pub use posix::PosixSemaphore;
pub use semaphore::CountingSemaphore;
pub use sysv::{SysVConfig, SysVSemaphore};
pub use token::KeyToken;
