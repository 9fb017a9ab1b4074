//! Structured errors for failed system calls.
//!
//! Every fallible operation in this crate reports an [`ErrnoError`]: the name
//! of the call that failed, the raw errno, its symbolic name and a rendered
//! message of the form `"<code>: <description>, <syscall>[ <extra>]"`.
//!
//! Two errors compare equal when they name the same syscall and errno; the
//! message and extra context do not take part in equality.

use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;
use std::io;

use libc::c_int;

/// Result type used throughout the crate.
pub type Result<T, E = ErrnoError> = std::result::Result<T, E>;

/// A system call failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ErrnoError {
    syscall: &'static str,
    code: Cow<'static, str>,
    errno: c_int,
    message: String,
}

impl ErrnoError {
    /// Build an error for `syscall` failing with `errno`.
    pub fn new(syscall: &'static str, errno: c_int) -> Self {
        let code = match errno_name(errno) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("E{errno}")),
        };
        let message = format!("{code}: {}, {syscall}", describe(errno));
        Self {
            syscall,
            code,
            errno,
            message,
        }
    }

    /// Capture the calling thread's errno for a call to `syscall` that just
    /// returned its failure sentinel.
    pub fn last(syscall: &'static str) -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::new(syscall, errno)
    }

    /// Append context (a semaphore name, a key) to the rendered message.
    pub fn with_extra(mut self, extra: impl fmt::Display) -> Self {
        use fmt::Write;
        let _ = write!(self.message, " {extra}");
        self
    }

    /// Name of the operation that failed, e.g. `sem_open` or `semget`.
    pub fn syscall(&self) -> &'static str {
        self.syscall
    }

    /// Symbolic errno name, e.g. `ENOENT`. Errnos without a known name
    /// render as `E<number>`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Raw platform errno.
    pub fn errno(&self) -> c_int {
        self.errno
    }

    /// Rendered message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The `std::io` classification of this errno.
    pub fn kind(&self) -> io::ErrorKind {
        io::Error::from_raw_os_error(self.errno).kind()
    }

    /// The named object does not exist.
    pub fn is_not_found(&self) -> bool {
        self.errno == libc::ENOENT
    }

    /// An exclusive create found the object already present.
    pub fn is_exists(&self) -> bool {
        self.errno == libc::EEXIST
    }

    /// The handle or descriptor is not usable (closed, removed or invalid).
    pub fn is_bad_handle(&self) -> bool {
        matches!(self.errno, libc::EBADF | libc::EINVAL | libc::EIDRM)
    }
}

impl PartialEq for ErrnoError {
    fn eq(&self, other: &Self) -> bool {
        self.syscall == other.syscall && self.errno == other.errno
    }
}

impl Eq for ErrnoError {}

impl From<ErrnoError> for io::Error {
    fn from(err: ErrnoError) -> Self {
        io::Error::from_raw_os_error(err.errno)
    }
}

/// Human-readable description from the platform's `strerror_r`.
fn describe(errno: c_int) -> String {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is writable for buf.len() bytes; the XSI strerror_r
    // NUL-terminates on success.
    let rc = unsafe { libc::strerror_r(errno, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return format!("Unknown error {errno}");
    }
    // SAFETY: strerror_r returned 0, so buf holds a NUL-terminated string.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Errno names every supported unix exposes.
///
/// Where two names share a number on a platform (`EAGAIN`/`EWOULDBLOCK`,
/// `ENOTSUP`/`EOPNOTSUPP` and `EDEADLK`/`EDEADLOCK` on Linux) the first entry
/// wins.
const ERRNO_NAMES: &[(c_int, &str)] = &[
    (libc::EPERM, "EPERM"),
    (libc::ENOENT, "ENOENT"),
    (libc::ESRCH, "ESRCH"),
    (libc::EINTR, "EINTR"),
    (libc::EIO, "EIO"),
    (libc::ENXIO, "ENXIO"),
    (libc::E2BIG, "E2BIG"),
    (libc::ENOEXEC, "ENOEXEC"),
    (libc::EBADF, "EBADF"),
    (libc::ECHILD, "ECHILD"),
    (libc::EAGAIN, "EAGAIN"),
    (libc::EWOULDBLOCK, "EWOULDBLOCK"),
    (libc::ENOMEM, "ENOMEM"),
    (libc::EACCES, "EACCES"),
    (libc::EFAULT, "EFAULT"),
    (libc::ENOTBLK, "ENOTBLK"),
    (libc::EBUSY, "EBUSY"),
    (libc::EEXIST, "EEXIST"),
    (libc::EXDEV, "EXDEV"),
    (libc::ENODEV, "ENODEV"),
    (libc::ENOTDIR, "ENOTDIR"),
    (libc::EISDIR, "EISDIR"),
    (libc::EINVAL, "EINVAL"),
    (libc::ENFILE, "ENFILE"),
    (libc::EMFILE, "EMFILE"),
    (libc::ENOTTY, "ENOTTY"),
    (libc::ETXTBSY, "ETXTBSY"),
    (libc::EFBIG, "EFBIG"),
    (libc::ENOSPC, "ENOSPC"),
    (libc::ESPIPE, "ESPIPE"),
    (libc::EROFS, "EROFS"),
    (libc::EMLINK, "EMLINK"),
    (libc::EPIPE, "EPIPE"),
    (libc::EDOM, "EDOM"),
    (libc::ERANGE, "ERANGE"),
    (libc::EDEADLK, "EDEADLK"),
    (libc::ENAMETOOLONG, "ENAMETOOLONG"),
    (libc::ENOLCK, "ENOLCK"),
    (libc::ENOSYS, "ENOSYS"),
    (libc::ENOTEMPTY, "ENOTEMPTY"),
    (libc::ELOOP, "ELOOP"),
    (libc::ENOMSG, "ENOMSG"),
    (libc::EIDRM, "EIDRM"),
    (libc::ENOLINK, "ENOLINK"),
    (libc::EPROTO, "EPROTO"),
    (libc::EMULTIHOP, "EMULTIHOP"),
    (libc::EBADMSG, "EBADMSG"),
    (libc::EOVERFLOW, "EOVERFLOW"),
    (libc::EILSEQ, "EILSEQ"),
    (libc::EUSERS, "EUSERS"),
    (libc::ENOTSOCK, "ENOTSOCK"),
    (libc::EDESTADDRREQ, "EDESTADDRREQ"),
    (libc::EMSGSIZE, "EMSGSIZE"),
    (libc::EPROTOTYPE, "EPROTOTYPE"),
    (libc::ENOPROTOOPT, "ENOPROTOOPT"),
    (libc::EPROTONOSUPPORT, "EPROTONOSUPPORT"),
    (libc::ESOCKTNOSUPPORT, "ESOCKTNOSUPPORT"),
    (libc::ENOTSUP, "ENOTSUP"),
    (libc::EOPNOTSUPP, "EOPNOTSUPP"),
    (libc::EPFNOSUPPORT, "EPFNOSUPPORT"),
    (libc::EAFNOSUPPORT, "EAFNOSUPPORT"),
    (libc::EADDRINUSE, "EADDRINUSE"),
    (libc::EADDRNOTAVAIL, "EADDRNOTAVAIL"),
    (libc::ENETDOWN, "ENETDOWN"),
    (libc::ENETUNREACH, "ENETUNREACH"),
    (libc::ENETRESET, "ENETRESET"),
    (libc::ECONNABORTED, "ECONNABORTED"),
    (libc::ECONNRESET, "ECONNRESET"),
    (libc::ENOBUFS, "ENOBUFS"),
    (libc::EISCONN, "EISCONN"),
    (libc::ENOTCONN, "ENOTCONN"),
    (libc::ESHUTDOWN, "ESHUTDOWN"),
    (libc::ETOOMANYREFS, "ETOOMANYREFS"),
    (libc::ETIMEDOUT, "ETIMEDOUT"),
    (libc::ECONNREFUSED, "ECONNREFUSED"),
    (libc::EHOSTDOWN, "EHOSTDOWN"),
    (libc::EHOSTUNREACH, "EHOSTUNREACH"),
    (libc::EALREADY, "EALREADY"),
    (libc::EINPROGRESS, "EINPROGRESS"),
    (libc::ESTALE, "ESTALE"),
    (libc::EDQUOT, "EDQUOT"),
    (libc::EREMOTE, "EREMOTE"),
    (libc::ECANCELED, "ECANCELED"),
    (libc::EOWNERDEAD, "EOWNERDEAD"),
    (libc::ENOTRECOVERABLE, "ENOTRECOVERABLE"),
];

#[cfg(target_os = "linux")]
const PLATFORM_ERRNO_NAMES: &[(c_int, &str)] = &[
    (libc::ENOSTR, "ENOSTR"),
    (libc::ENODATA, "ENODATA"),
    (libc::ETIME, "ETIME"),
    (libc::ENOSR, "ENOSR"),
    (libc::EDEADLOCK, "EDEADLOCK"),
    (libc::ECHRNG, "ECHRNG"),
    (libc::EL2NSYNC, "EL2NSYNC"),
    (libc::EL3HLT, "EL3HLT"),
    (libc::EL3RST, "EL3RST"),
    (libc::ELNRNG, "ELNRNG"),
    (libc::EUNATCH, "EUNATCH"),
    (libc::ENOCSI, "ENOCSI"),
    (libc::EL2HLT, "EL2HLT"),
    (libc::EBADE, "EBADE"),
    (libc::EBADR, "EBADR"),
    (libc::EXFULL, "EXFULL"),
    (libc::ENOANO, "ENOANO"),
    (libc::EBADRQC, "EBADRQC"),
    (libc::EBADSLT, "EBADSLT"),
    (libc::EBFONT, "EBFONT"),
    (libc::ENONET, "ENONET"),
    (libc::ENOPKG, "ENOPKG"),
    (libc::EADV, "EADV"),
    (libc::ESRMNT, "ESRMNT"),
    (libc::ECOMM, "ECOMM"),
    (libc::EDOTDOT, "EDOTDOT"),
    (libc::ENOTUNIQ, "ENOTUNIQ"),
    (libc::EBADFD, "EBADFD"),
    (libc::EREMCHG, "EREMCHG"),
    (libc::ELIBACC, "ELIBACC"),
    (libc::ELIBBAD, "ELIBBAD"),
    (libc::ELIBSCN, "ELIBSCN"),
    (libc::ELIBMAX, "ELIBMAX"),
    (libc::ELIBEXEC, "ELIBEXEC"),
    (libc::ERESTART, "ERESTART"),
    (libc::ESTRPIPE, "ESTRPIPE"),
    (libc::EUCLEAN, "EUCLEAN"),
    (libc::ENOTNAM, "ENOTNAM"),
    (libc::ENAVAIL, "ENAVAIL"),
    (libc::EISNAM, "EISNAM"),
    (libc::EREMOTEIO, "EREMOTEIO"),
    (libc::ENOMEDIUM, "ENOMEDIUM"),
    (libc::EMEDIUMTYPE, "EMEDIUMTYPE"),
    (libc::ENOKEY, "ENOKEY"),
    (libc::EKEYEXPIRED, "EKEYEXPIRED"),
    (libc::EKEYREVOKED, "EKEYREVOKED"),
    (libc::EKEYREJECTED, "EKEYREJECTED"),
    (libc::ERFKILL, "ERFKILL"),
    (libc::EHWPOISON, "EHWPOISON"),
];

#[cfg(target_vendor = "apple")]
const PLATFORM_ERRNO_NAMES: &[(c_int, &str)] = &[
    (libc::ENOSTR, "ENOSTR"),
    (libc::ENODATA, "ENODATA"),
    (libc::ETIME, "ETIME"),
    (libc::ENOSR, "ENOSR"),
    (libc::EPROCLIM, "EPROCLIM"),
    (libc::EBADRPC, "EBADRPC"),
    (libc::ERPCMISMATCH, "ERPCMISMATCH"),
    (libc::EPROGUNAVAIL, "EPROGUNAVAIL"),
    (libc::EPROGMISMATCH, "EPROGMISMATCH"),
    (libc::EPROCUNAVAIL, "EPROCUNAVAIL"),
    (libc::EFTYPE, "EFTYPE"),
    (libc::EAUTH, "EAUTH"),
    (libc::ENEEDAUTH, "ENEEDAUTH"),
    (libc::EPWROFF, "EPWROFF"),
    (libc::EDEVERR, "EDEVERR"),
    (libc::EBADEXEC, "EBADEXEC"),
    (libc::EBADARCH, "EBADARCH"),
    (libc::ESHLIBVERS, "ESHLIBVERS"),
    (libc::EBADMACHO, "EBADMACHO"),
    (libc::ENOATTR, "ENOATTR"),
    (libc::ENOPOLICY, "ENOPOLICY"),
    (libc::EQFULL, "EQFULL"),
];

#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
const PLATFORM_ERRNO_NAMES: &[(c_int, &str)] = &[];

/// Look up the symbolic name of `errno`.
pub fn errno_name(errno: c_int) -> Option<&'static str> {
    ERRNO_NAMES
        .iter()
        .chain(PLATFORM_ERRNO_NAMES)
        .find(|(number, _)| *number == errno)
        .map(|(_, name)| *name)
}
