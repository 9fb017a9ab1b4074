//! `flock` conflicts between forked processes.

mod support;

use std::fs::File;
use std::time::{Duration, Instant};

use ipc_sync::FileLockExt;
use support::{check, fork};

#[test]
fn shared_locks_coexist_across_processes() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let ours = File::open(file.path()).unwrap();
    ours.flock_share().unwrap();

    let path = file.path().to_path_buf();
    let child = fork(move || {
        let theirs = File::open(&path).unwrap();
        check(theirs.try_flock_share().unwrap())
    });
    assert_eq!(child.wait(), 0);
}

#[test]
fn exclusive_waits_for_shared_holder() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let ours = File::open(file.path()).unwrap();
    ours.flock_share().unwrap();

    let path = file.path().to_path_buf();
    let mut child = fork(move || {
        let theirs = File::open(&path).unwrap();
        theirs.flock_exclusive().unwrap();
        0
    });

    std::thread::sleep(Duration::from_millis(100));
    assert!(child.is_running(), "exclusive lock granted while shared was held");
    ours.flock_unlock().unwrap();
    assert_eq!(child.wait(), 0);
}

#[test]
fn nonblocking_requests_fail_fast() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let ours = File::open(file.path()).unwrap();
    ours.flock_exclusive().unwrap();

    let path = file.path().to_path_buf();
    let child = fork(move || {
        let theirs = File::open(&path).unwrap();
        let start = Instant::now();
        let share = theirs.try_flock_share().unwrap();
        let exclusive = theirs.try_flock_exclusive().unwrap();
        check(!share && !exclusive && start.elapsed() < Duration::from_millis(50))
    });
    assert_eq!(child.wait(), 0);
}

#[test]
fn inherited_descriptor_shares_the_lock() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let ours = File::open(file.path()).unwrap();
    ours.flock_exclusive().unwrap();

    // Same open file description, so no conflict with ourselves.
    let child = fork(|| check(ours.try_flock_exclusive().unwrap()));
    assert_eq!(child.wait(), 0);
}

#[test]
fn lock_is_released_when_the_holder_exits() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.path().to_path_buf();
    let child = fork(move || {
        let theirs = File::open(&path).unwrap();
        theirs.flock_exclusive().unwrap();
        0
    });
    assert_eq!(child.wait(), 0);

    let ours = File::open(file.path()).unwrap();
    assert!(ours.try_flock_exclusive().unwrap());
}
