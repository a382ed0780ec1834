//! Write-ahead log crash tests: simulated power failures on either side
//! of the commit point, followed by a remount that runs recovery.

use ferrite_kernel::error::KernelError;
use ferrite_kernel::fs::log::CrashPoint;
use ferrite_kernel::fs::testing::fresh_fs;
use ferrite_kernel::fs::{InodeType, BSIZE};

#[test]
fn committed_transaction_survives_a_clean_remount() {
    let t = fresh_fs();
    t.fs.log.begin_op(&t.fs);
    let ip = t
        .fs
        .create(b"/durable", InodeType::Dir, 0, 0, None)
        .expect("mkdir");
    t.fs.iput(ip);
    t.fs.log.end_op(&t.fs).expect("commit");

    let again = t.remount();
    let ip = again
        .fs
        .namei(b"/durable", None)
        .expect("directory persists across remount");
    again.fs.iput(ip);
}

#[test]
fn crash_after_commit_is_replayed_on_mount() {
    let t = fresh_fs();
    t.fs.log.set_crash_point(CrashPoint::AfterCommit);

    t.fs.log.begin_op(&t.fs);
    let ip = t
        .fs
        .create(b"/dir_success", InodeType::Dir, 0, 0, None)
        .expect("mkdir");
    t.fs.iput(ip);
    let err = t.fs.log.end_op(&t.fs).unwrap_err();
    assert!(matches!(err, KernelError::SimulatedCrash { .. }));

    // Power comes back: mount runs recovery and installs the
    // transaction from the log region.
    let again = t.remount();
    let ip = again
        .fs
        .namei(b"/dir_success", None)
        .expect("committed directory exists after replay");
    let mut guard = again.fs.ilock(ip).expect("ilock");
    assert_eq!(guard.typ, InodeType::Dir);

    let (dot, _) = again
        .fs
        .dirlookup(&mut guard, b".")
        .expect("lookup")
        .expect("'.' present after recovery");
    let (dotdot, _) = again
        .fs
        .dirlookup(&mut guard, b"..")
        .expect("lookup")
        .expect("'..' present after recovery");
    assert_eq!(dot.inum, ip.inum);
    drop(guard);
    again.fs.iput(dot);
    again.fs.iput(dotdot);
    again.fs.iput(ip);
}

#[test]
fn crash_before_header_write_loses_the_operation_cleanly() {
    let t = fresh_fs();

    // Remember the root directory's contents.
    let root_before = {
        let mut raw = [0u8; BSIZE];
        let root = t.fs.namei(b"/", None).expect("root");
        let mut guard = t.fs.ilock(root).expect("ilock");
        let n = guard
            .read(false, raw.as_mut_ptr() as usize, 0, BSIZE)
            .expect("read root");
        drop(guard);
        t.fs.iput(root);
        (raw, n)
    };

    t.fs.log.set_crash_point(CrashPoint::DuringLogWrite);
    t.fs.log.begin_op(&t.fs);
    let ip = t
        .fs
        .create(b"/dir_fail", InodeType::Dir, 0, 0, None)
        .expect("mkdir stages in the cache");
    t.fs.iput(ip);
    let err = t.fs.log.end_op(&t.fs).unwrap_err();
    assert!(matches!(err, KernelError::SimulatedCrash { .. }));

    // The header never made it to disk, so mount finds n == 0 and
    // replays nothing.
    let again = t.remount();
    assert!(
        again.fs.namei(b"/dir_fail", None).is_err(),
        "uncommitted directory must not exist"
    );

    let root = again.fs.namei(b"/", None).expect("root");
    let mut guard = again.fs.ilock(root).expect("ilock");
    let mut raw = [0u8; BSIZE];
    let n = guard
        .read(false, raw.as_mut_ptr() as usize, 0, BSIZE)
        .expect("read root");
    assert_eq!((raw, n), root_before, "root directory data is untouched");
    drop(guard);
    again.fs.iput(root);
}

#[test]
fn recovery_is_at_most_once() {
    let t = fresh_fs();
    t.fs.log.set_crash_point(CrashPoint::AfterCommit);
    t.fs.log.begin_op(&t.fs);
    let ip = t
        .fs
        .create(b"/once", InodeType::File, 0, 0, None)
        .expect("create");
    t.fs.iput(ip);
    let _ = t.fs.log.end_op(&t.fs).unwrap_err();

    // First remount replays; second remount must find a clean header
    // and replay nothing (the install also cleared it on disk).
    let second = t.remount();
    let ip = second.fs.namei(b"/once", None).expect("replayed");
    second.fs.iput(ip);

    let third = second.remount();
    let ip = third.fs.namei(b"/once", None).expect("still there");
    third.fs.iput(ip);
}

#[test]
fn transactions_after_recovery_work_normally() {
    let t = fresh_fs();
    t.fs.log.set_crash_point(CrashPoint::AfterCommit);
    t.fs.log.begin_op(&t.fs);
    let ip = t
        .fs
        .create(b"/pre_crash", InodeType::Dir, 0, 0, None)
        .expect("mkdir");
    t.fs.iput(ip);
    let _ = t.fs.log.end_op(&t.fs).unwrap_err();

    let again = t.remount();
    again.fs.log.begin_op(&again.fs);
    let ip = again
        .fs
        .create(b"/pre_crash/post", InodeType::File, 0, 0, None)
        .expect("create inside the recovered directory");
    again.fs.iput(ip);
    again.fs.log.end_op(&again.fs).expect("commit");

    let ip = again
        .fs
        .namei(b"/pre_crash/post", None)
        .expect("resolves");
    again.fs.iput(ip);
}
