//! System V semaphore sets with a kernel-resident reference count.
//!
//! Every set created here holds exactly two semaphores under one key:
//!
//! | slot | role                                                    |
//! |------|---------------------------------------------------------|
//! | 0    | the user-visible counter (`wait` / `trywait` / `post`)  |
//! | 1    | number of open handles across all processes             |
//!
//! No process coordinates the lifetime of a set. Instead every handle adds
//! one to slot 1 and removes it on close, and the close that takes slot 1 to
//! zero removes the set. All slot 1 updates are single `semop` groups, so the
//! kernel applies each of them atomically with respect to every other
//! process:
//!
//! - create: `{refs += 1, counter += value}` on a set fresh from `IPC_EXCL`
//! - open:   `{refs -= 1 (nowait), refs += 2}`, which only succeeds while
//!   refs is non-zero
//! - close:  `{refs -= 2 (nowait), refs += 1}` while other handles remain,
//!   else `{refs -= 1 (nowait), refs == 0 (nowait)}` for the last one
//!
//! Because open refuses to increment a zero count, a set whose count has
//! reached zero after initialisation can never be joined again. Such a set is
//! dead: create and open remove it and carry on as if the key were free,
//! which also finishes the job of a last closer that crashed before its
//! `IPC_RMID`. A freshly created set has a zero count too, but no `semop` has
//! touched slot 1 yet (`GETPID` reads 0), which is how the two are told apart.
//!
//! A holder that crashes without closing leaves its unit in slot 1 and the
//! set outlives it. [`SysVConfig::undo_on_exit`] opts into `SEM_UNDO` on
//! slot 1 so the kernel gives the unit back at process exit.

use std::thread;
use std::time::Duration;

use libc::c_int;

use crate::error::{ErrnoError, Result};
use crate::mode::Mode;
use crate::semaphore::CountingSemaphore;
use crate::token::KeyToken;

const COUNTER: u16 = 0;
const REFS: u16 = 1;
const NSEMS: c_int = 2;

/// Largest value a single operation can add or remove (`semop` takes a
/// `short`). Also the largest initial value.
pub const MAX_OPERAND: u32 = i16::MAX as u32;

/// Tuning for System V create and open.
#[derive(Debug, Clone)]
pub struct SysVConfig {
    /// How many times to back off when the set is still being initialised
    /// by its creator before giving up with `EAGAIN`.
    pub init_retries: u32,
    /// Sleep between those attempts.
    pub init_backoff: Duration,
    /// Issue reference-count updates with `SEM_UNDO`, so a process that
    /// exits without closing still returns its references.
    ///
    /// Every handle to a key should agree on this setting.
    pub undo_on_exit: bool,
}

impl Default for SysVConfig {
    fn default() -> Self {
        Self {
            init_retries: 500,
            init_backoff: Duration::from_millis(1),
            undo_on_exit: false,
        }
    }
}

/// One attachment to a reference-counted System V semaphore set.
///
/// Dropping an open handle closes it, which may remove the set.
#[derive(Debug)]
pub struct SysVSemaphore {
    semid: Option<c_int>,
    token: KeyToken,
    creator: bool,
    ref_flags: c_int,
}

/// Outcome of trying to join an existing set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Join {
    Joined,
    /// Created but the creator has not run its first `semop` yet.
    Initializing,
    /// Reference count reached zero after initialisation.
    Dead,
    /// Removed from under us.
    Removed,
    /// The count moved while we looked; try again.
    Raced,
}

impl SysVSemaphore {
    /// Attach to the set for `token`, creating it with `mode` and `value` if
    /// absent. An existing set keeps its current counter value.
    pub fn create(token: &KeyToken, mode: Mode, value: u32) -> Result<Self> {
        Self::create_with(token, mode, value, &SysVConfig::default())
    }

    pub fn create_with(
        token: &KeyToken,
        mode: Mode,
        value: u32,
        config: &SysVConfig,
    ) -> Result<Self> {
        Self::create_set(token, mode, value, false, config)
    }

    /// Same as [`create`](Self::create).
    pub fn create_shared(token: &KeyToken, mode: Mode, value: u32) -> Result<Self> {
        Self::create(token, mode, value)
    }

    /// Create the set for `token`, failing `EEXIST` if a live one exists.
    pub fn create_exclusive(token: &KeyToken, mode: Mode, value: u32) -> Result<Self> {
        Self::create_exclusive_with(token, mode, value, &SysVConfig::default())
    }

    pub fn create_exclusive_with(
        token: &KeyToken,
        mode: Mode,
        value: u32,
        config: &SysVConfig,
    ) -> Result<Self> {
        Self::create_set(token, mode, value, true, config)
    }

    /// Attach to an existing set. Fails `ENOENT` if `token` names none.
    pub fn open(token: &KeyToken) -> Result<Self> {
        Self::open_with(token, &SysVConfig::default())
    }

    pub fn open_with(token: &KeyToken, config: &SysVConfig) -> Result<Self> {
        let ref_flags = ref_flags(config);
        let mut backoff = InitBackoff::new(config);
        loop {
            let semid = semget(token.key(), NSEMS, 0).map_err(at_key(token))?;
            if let Some(sem) = Self::join_existing(semid, token, ref_flags, &mut backoff)? {
                return Ok(sem);
            }
        }
    }

    /// Remove the set for `token` regardless of its reference count.
    ///
    /// Meant for cleanup. Other processes' handles to the set start failing
    /// with `EIDRM`/`EINVAL`.
    pub fn unlink(token: &KeyToken) -> Result<()> {
        let semid = semget(token.key(), 0, 0).map_err(at_key(token))?;
        remove(semid).map_err(at_key(token))?;
        tracing::debug!(key = token.key(), semid, "unlinked sysv semaphore set");
        Ok(())
    }

    fn create_set(
        token: &KeyToken,
        mode: Mode,
        value: u32,
        exclusive: bool,
        config: &SysVConfig,
    ) -> Result<Self> {
        let initial = operand(value, true).map_err(at_key(token))?;
        let ref_flags = ref_flags(config);
        let flags = mode.permissions() as c_int | libc::IPC_CREAT | libc::IPC_EXCL;
        let mut backoff = InitBackoff::new(config);

        loop {
            let err = match semget(token.key(), NSEMS, flags) {
                Ok(semid) => match initialize(semid, initial, ref_flags) {
                    Ok(()) => {
                        tracing::debug!(
                            key = token.key(),
                            semid,
                            value,
                            "created sysv semaphore set"
                        );
                        return Ok(Self::attached(semid, token, true, ref_flags));
                    }
                    // Removed between semget and initialisation.
                    Err(err) if !exclusive && is_removed(&err) => continue,
                    Err(err) => {
                        let _ = remove(semid);
                        return Err(err.with_extra(key_of(token)));
                    }
                },
                Err(err) => err,
            };
            if err.errno() != libc::EEXIST {
                return Err(err.with_extra(key_of(token)));
            }

            let semid = match semget(token.key(), NSEMS, 0) {
                Ok(semid) => semid,
                Err(lost) if lost.errno() == libc::ENOENT => continue,
                Err(lost) => return Err(lost.with_extra(key_of(token))),
            };

            if exclusive {
                match idle_state(semid)? {
                    Join::Dead => reclaim(semid, token)?,
                    Join::Removed => {}
                    Join::Joined | Join::Initializing | Join::Raced => {
                        return Err(err.with_extra(key_of(token)));
                    }
                }
                continue;
            }

            if let Some(sem) = Self::join_existing(semid, token, ref_flags, &mut backoff)? {
                return Ok(sem);
            }
        }
    }

    /// Try to take a reference on `semid`. `None` means start over.
    fn join_existing(
        semid: c_int,
        token: &KeyToken,
        ref_flags: c_int,
        backoff: &mut InitBackoff<'_>,
    ) -> Result<Option<Self>> {
        match join(semid, ref_flags).map_err(at_key(token))? {
            Join::Joined => {
                tracing::debug!(key = token.key(), semid, "opened sysv semaphore set");
                Ok(Some(Self::attached(semid, token, false, ref_flags)))
            }
            Join::Dead => {
                reclaim(semid, token)?;
                Ok(None)
            }
            Join::Initializing => {
                backoff.pause(token)?;
                Ok(None)
            }
            Join::Removed | Join::Raced => Ok(None),
        }
    }

    fn attached(semid: c_int, token: &KeyToken, creator: bool, ref_flags: c_int) -> Self {
        Self {
            semid: Some(semid),
            token: token.clone(),
            creator,
            ref_flags,
        }
    }

    fn semid(&self, syscall: &'static str) -> Result<c_int> {
        self.semid
            .ok_or_else(|| ErrnoError::new(syscall, libc::EINVAL).with_extra(key_of(&self.token)))
    }

    /// The key this handle was opened with.
    pub fn token(&self) -> &KeyToken {
        &self.token
    }

    /// Whether this handle created the set (as opposed to joining it).
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Kernel identifier of the set, `None` once closed.
    pub fn id(&self) -> Option<c_int> {
        self.semid
    }

    pub fn is_closed(&self) -> bool {
        self.semid.is_none()
    }

    /// Decrement the counter by one, blocking while it is zero.
    pub fn wait(&self) -> Result<()> {
        self.wait_n(1)
    }

    /// Decrement the counter by `n`, blocking until it is at least `n`.
    pub fn wait_n(&self, n: u32) -> Result<()> {
        let semid = self.semid("semop")?;
        let delta = operand(n, false)?;
        semop(semid, &mut [op(COUNTER, -delta, 0)]).map_err(at_key(&self.token))
    }

    /// Decrement the counter by one if positive.
    pub fn trywait(&self) -> Result<bool> {
        self.trywait_n(1)
    }

    /// Decrement the counter by `n` if it is at least `n`; never blocks.
    pub fn trywait_n(&self, n: u32) -> Result<bool> {
        let semid = self.semid("semop")?;
        let delta = operand(n, false)?;
        match semop(semid, &mut [op(COUNTER, -delta, libc::IPC_NOWAIT)]) {
            Ok(()) => Ok(true),
            Err(err) if err.errno() == libc::EAGAIN => Ok(false),
            Err(err) => Err(err.with_extra(key_of(&self.token))),
        }
    }

    /// Increment the counter by one.
    pub fn post(&self) -> Result<()> {
        self.post_n(1)
    }

    /// Increment the counter by `n`. Fails `ERANGE` past the kernel maximum.
    pub fn post_n(&self, n: u32) -> Result<()> {
        let semid = self.semid("semop")?;
        let delta = operand(n, false)?;
        semop(semid, &mut [op(COUNTER, delta, 0)]).map_err(at_key(&self.token))
    }

    /// Current counter value.
    pub fn value(&self) -> Result<u32> {
        let semid = self.semid("semctl")?;
        get(semid, COUNTER, libc::GETVAL)
            .map(|v| v as u32)
            .map_err(at_key(&self.token))
    }

    /// Current number of open handles, across every process.
    ///
    /// Diagnostic only: the count can change as soon as it is read.
    pub fn refs(&self) -> Result<u32> {
        let semid = self.semid("semctl")?;
        get(semid, REFS, libc::GETVAL)
            .map(|v| v as u32)
            .map_err(at_key(&self.token))
    }

    /// Give back this handle's reference, removing the set if it was the
    /// last one.
    ///
    /// The handle counts as closed even if this returns an error. Calling it
    /// again, or any other operation afterwards, fails `EINVAL`.
    pub fn close(&mut self) -> Result<()> {
        let semid = self.semid("semop")?;
        self.semid = None;
        let flags = self.ref_flags;

        loop {
            match semop(semid, &mut [op(REFS, -2, flags), op(REFS, 1, flags)]) {
                Ok(()) => {
                    tracing::debug!(key = self.token.key(), semid, "closed sysv semaphore handle");
                    return Ok(());
                }
                Err(err) if err.errno() != libc::EAGAIN => {
                    return Err(err.with_extra(key_of(&self.token)));
                }
                Err(_) => {}
            }

            match semop(semid, &mut [op(REFS, -1, flags), op(REFS, 0, libc::IPC_NOWAIT)]) {
                Ok(()) => return self.destroy(semid),
                Err(err) if err.errno() != libc::EAGAIN => {
                    return Err(err.with_extra(key_of(&self.token)));
                }
                Err(_) => {}
            }

            // Neither group applied: either another handle came or went
            // between the two attempts, or the count is already zero and
            // the set is dead.
            let refs = get(semid, REFS, libc::GETVAL).map_err(at_key(&self.token))?;
            if refs == 0 {
                return self.destroy(semid);
            }
        }
    }

    fn destroy(&self, semid: c_int) -> Result<()> {
        match remove(semid) {
            Ok(()) => {}
            // A concurrent opener reclaimed it first.
            Err(err) if is_removed(&err) => {}
            Err(err) => return Err(err.with_extra(key_of(&self.token))),
        }
        tracing::debug!(
            key = self.token.key(),
            semid,
            "last reference closed, removed sysv semaphore set"
        );
        Ok(())
    }
}

impl CountingSemaphore for SysVSemaphore {
    fn wait(&self) -> Result<()> {
        SysVSemaphore::wait(self)
    }

    fn trywait(&self) -> Result<bool> {
        SysVSemaphore::trywait(self)
    }

    fn post(&self) -> Result<()> {
        SysVSemaphore::post(self)
    }
}

impl Drop for SysVSemaphore {
    fn drop(&mut self) {
        if self.semid.is_some()
            && let Err(err) = self.close()
        {
            tracing::warn!(
                key = self.token.key(),
                error = %err,
                "failed to close sysv semaphore on drop"
            );
        }
    }
}

struct InitBackoff<'a> {
    config: &'a SysVConfig,
    waited: u32,
}

impl<'a> InitBackoff<'a> {
    fn new(config: &'a SysVConfig) -> Self {
        Self { config, waited: 0 }
    }

    fn pause(&mut self, token: &KeyToken) -> Result<()> {
        if self.waited >= self.config.init_retries {
            return Err(ErrnoError::new("semop", libc::EAGAIN)
                .with_extra(format_args!("{} still initializing", key_of(token))));
        }
        self.waited += 1;
        thread::sleep(self.config.init_backoff);
        Ok(())
    }
}

fn ref_flags(config: &SysVConfig) -> c_int {
    if config.undo_on_exit {
        libc::IPC_NOWAIT | libc::SEM_UNDO
    } else {
        libc::IPC_NOWAIT
    }
}

fn key_of(token: &KeyToken) -> String {
    format!("key {:#x}", token.key())
}

fn at_key(token: &KeyToken) -> impl FnOnce(ErrnoError) -> ErrnoError + '_ {
    move |err| err.with_extra(key_of(token))
}

/// Convert a count to a `semop` operand.
fn operand(n: u32, allow_zero: bool) -> Result<i16> {
    if n == 0 && !allow_zero {
        return Err(ErrnoError::new("semop", libc::EINVAL).with_extra("count must be positive"));
    }
    i16::try_from(n).map_err(|_| {
        ErrnoError::new("semop", libc::EINVAL)
            .with_extra(format_args!("count {n} exceeds {MAX_OPERAND}"))
    })
}

fn op(num: u16, delta: i16, flags: c_int) -> libc::sembuf {
    libc::sembuf {
        sem_num: num,
        sem_op: delta,
        sem_flg: flags as libc::c_short,
    }
}

fn semop(semid: c_int, ops: &mut [libc::sembuf]) -> Result<()> {
    loop {
        // SAFETY: ops points to ops.len() initialised sembuf entries.
        if unsafe { libc::semop(semid, ops.as_mut_ptr(), ops.len()) } == 0 {
            return Ok(());
        }
        let err = ErrnoError::last("semop");
        if err.errno() != libc::EINTR {
            return Err(err);
        }
    }
}

fn semget(key: libc::key_t, nsems: c_int, flags: c_int) -> Result<c_int> {
    // SAFETY: semget takes no pointers.
    let semid = unsafe { libc::semget(key, nsems, flags) };
    if semid == -1 {
        return Err(ErrnoError::last("semget"));
    }
    Ok(semid)
}

/// `semctl` for the commands that take no argument (`GETVAL`, `GETPID`).
fn get(semid: c_int, num: u16, cmd: c_int) -> Result<c_int> {
    // SAFETY: these commands do not read the variadic argument.
    let value = unsafe { libc::semctl(semid, c_int::from(num), cmd) };
    if value == -1 {
        return Err(ErrnoError::last("semctl"));
    }
    Ok(value)
}

fn remove(semid: c_int) -> Result<()> {
    // SAFETY: IPC_RMID does not read the variadic argument.
    if unsafe { libc::semctl(semid, 0, libc::IPC_RMID) } == -1 {
        return Err(ErrnoError::last("semctl"));
    }
    Ok(())
}

/// The set behind a semid no longer exists.
fn is_removed(err: &ErrnoError) -> bool {
    matches!(err.errno(), libc::EIDRM | libc::EINVAL)
}

/// Publish a fresh set: take the creator's reference and set the counter.
fn initialize(semid: c_int, initial: i16, ref_flags: c_int) -> Result<()> {
    let mut ops = [op(REFS, 1, ref_flags), op(COUNTER, initial, 0)];
    let ops = if initial > 0 { &mut ops[..] } else { &mut ops[..1] };
    semop(semid, ops)
}

/// Take a reference on a set, unless its count is zero.
fn join(semid: c_int, ref_flags: c_int) -> Result<Join> {
    match semop(semid, &mut [op(REFS, -1, ref_flags), op(REFS, 2, ref_flags)]) {
        Ok(()) => Ok(Join::Joined),
        Err(err) if is_removed(&err) => Ok(Join::Removed),
        Err(err) if err.errno() == libc::EAGAIN => idle_state(semid),
        Err(err) => Err(err),
    }
}

/// Classify a set without touching its counts.
///
/// `GETPID` is read before the count: once it is non-zero the creator has
/// published the set, so a zero count read afterwards is final.
fn idle_state(semid: c_int) -> Result<Join> {
    let read = |cmd| match get(semid, REFS, cmd) {
        Ok(v) => Ok(Some(v)),
        Err(err) if is_removed(&err) => Ok(None),
        Err(err) => Err(err),
    };
    let Some(last_pid) = read(libc::GETPID)? else {
        return Ok(Join::Removed);
    };
    if last_pid == 0 {
        return Ok(Join::Initializing);
    }
    match read(libc::GETVAL)? {
        None => Ok(Join::Removed),
        Some(0) => Ok(Join::Dead),
        Some(_) => Ok(Join::Raced),
    }
}

/// Remove a dead set so its key can be reused.
fn reclaim(semid: c_int, token: &KeyToken) -> Result<()> {
    tracing::warn!(key = token.key(), semid, "removing abandoned sysv semaphore set");
    match remove(semid) {
        Ok(()) => Ok(()),
        Err(err) if is_removed(&err) => Ok(()),
        Err(err) => Err(err.with_extra(key_of(token))),
    }
}
