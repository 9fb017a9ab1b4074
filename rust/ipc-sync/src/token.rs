//! System V IPC keys derived from filesystem paths.
//!
//! A [`KeyToken`] wraps the result of `ftok(3)`: the path's device and inode
//! folded together with a one-byte project discriminator. Independent
//! processes that agree on a path and discriminator agree on the key, for as
//! long as the path keeps resolving to the same inode.

use std::ffi::CString;
use std::hash::{Hash, Hasher};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{ErrnoError, Result};

/// A System V key derived from an existing path and a discriminator.
///
/// Equality and hashing only consider the derived key.
#[derive(Debug, Clone)]
pub struct KeyToken {
    key: libc::key_t,
    path: PathBuf,
    discriminator: u8,
}

impl KeyToken {
    /// Derive the key for `path` and `discriminator`.
    ///
    /// `path` must exist (`ENOENT` otherwise) and `discriminator` must be in
    /// `0..=255` (`EINVAL` otherwise).
    pub fn derive(path: impl AsRef<Path>, discriminator: i32) -> Result<Self> {
        let path = path.as_ref();
        let Ok(id) = u8::try_from(discriminator) else {
            return Err(ErrnoError::new("ftok", libc::EINVAL)
                .with_extra(format_args!("discriminator {discriminator} out of range")));
        };
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| ErrnoError::new("ftok", libc::EINVAL).with_extra(path.display()))?;

        // SAFETY: c_path is a valid NUL-terminated string for the duration of
        // the call.
        let key = unsafe { libc::ftok(c_path.as_ptr(), libc::c_int::from(id)) };
        if key == -1 {
            return Err(ErrnoError::last("ftok").with_extra(path.display()));
        }

        tracing::trace!(path = %path.display(), discriminator = id, key, "derived ipc key");
        Ok(Self {
            key,
            path: path.to_path_buf(),
            discriminator: id,
        })
    }

    /// The raw `key_t` value.
    #[inline]
    pub fn key(&self) -> libc::key_t {
        self.key
    }

    /// Path the key was derived from.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn discriminator(&self) -> u8 {
        self.discriminator
    }
}

impl PartialEq for KeyToken {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for KeyToken {}

impl Hash for KeyToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}
