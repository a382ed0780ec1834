//! Synchronization and test-hook system calls.

use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::fs::log::CrashPoint;
use crate::sync::semaphore;
use crate::syscall::arg_int;

pub fn sys_sem_open() -> KernelResult<usize> {
    let init_value = arg_int(0);
    if init_value < 0 {
        return Err(KernelError::InvalidArgument { name: "value" });
    }
    semaphore::table().open(init_value as u32)
}

pub fn sys_sem_wait() -> KernelResult<usize> {
    let id = arg_int(0);
    if id < 0 {
        return Err(KernelError::InvalidArgument { name: "sem_id" });
    }
    semaphore::table().wait(id as usize)?;
    Ok(0)
}

pub fn sys_sem_signal() -> KernelResult<usize> {
    let id = arg_int(0);
    if id < 0 {
        return Err(KernelError::InvalidArgument { name: "sem_id" });
    }
    semaphore::table().signal(id as usize)?;
    Ok(0)
}

/// Arm the log's crash-injection point: 1 dies mid log-write, 2 dies
/// right after the header commit, 0 disarms.
pub fn sys_fslog_crash() -> KernelResult<usize> {
    let point = arg_int(0);
    if !(0..=2).contains(&point) {
        return Err(KernelError::InvalidArgument { name: "crash_point" });
    }
    fs::fs().log.set_crash_point(CrashPoint::from_raw(point as u64));
    Ok(0)
}
