//! System-call boundary: numbering, dispatch, and typed argument
//! fetching from the saved trap frame.
//!
//! Handlers are parameterless; they pull arguments out of the saved
//! registers (a0..a5) themselves and return a value that the dispatcher
//! writes back into the saved a0. Errors flatten to -1 at this boundary;
//! user space never sees kernel error structure. `exec` returns argc,
//! which is exactly what the new image's a0 must hold, so the uniform
//! write-back covers it too.

pub mod file;
pub mod process;
pub mod sync;

use crate::error::{KernelError, KernelResult};
use crate::fs::file::FileRef;
use crate::mm::uvm;
use crate::param::NOFILE;
use crate::proc;

// Stable system-call numbers.
pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_GETPID: usize = 4;
pub const SYS_EXEC: usize = 5;
pub const SYS_SBRK: usize = 6;
pub const SYS_SLEEP: usize = 7;
pub const SYS_UPTIME: usize = 8;
pub const SYS_OPEN: usize = 9;
pub const SYS_CLOSE: usize = 10;
pub const SYS_READ: usize = 11;
pub const SYS_WRITE: usize = 12;
pub const SYS_FSTAT: usize = 13;
pub const SYS_MKDIR: usize = 14;
pub const SYS_LINK: usize = 15;
pub const SYS_UNLINK: usize = 16;
pub const SYS_CHDIR: usize = 17;
pub const SYS_PIPE: usize = 18;
pub const SYS_SYSINFO: usize = 19;
pub const SYS_SEM_OPEN: usize = 20;
pub const SYS_SEM_WAIT: usize = 21;
pub const SYS_SEM_SIGNAL: usize = 22;
pub const SYS_FSLOG_CRASH: usize = 23;

/// Dispatch the system call identified by the saved a7, writing the
/// result into the saved a0.
pub fn dispatch() {
    let num = proc::with_current(|p| p.trapframe_mut().a7).expect("syscall without a process");

    let result: KernelResult<usize> = match num {
        SYS_FORK => process::sys_fork(),
        SYS_EXIT => process::sys_exit(),
        SYS_WAIT => process::sys_wait(),
        SYS_GETPID => process::sys_getpid(),
        SYS_EXEC => process::sys_exec(),
        SYS_SBRK => process::sys_sbrk(),
        SYS_SLEEP => process::sys_sleep(),
        SYS_UPTIME => process::sys_uptime(),
        SYS_OPEN => file::sys_open(),
        SYS_CLOSE => file::sys_close(),
        SYS_READ => file::sys_read(),
        SYS_WRITE => file::sys_write(),
        SYS_FSTAT => file::sys_fstat(),
        SYS_MKDIR => file::sys_mkdir(),
        SYS_LINK => file::sys_link(),
        SYS_UNLINK => file::sys_unlink(),
        SYS_CHDIR => file::sys_chdir(),
        SYS_PIPE => file::sys_pipe(),
        SYS_SYSINFO => file::sys_sysinfo(),
        SYS_SEM_OPEN => sync::sys_sem_open(),
        SYS_SEM_WAIT => sync::sys_sem_wait(),
        SYS_SEM_SIGNAL => sync::sys_sem_signal(),
        SYS_FSLOG_CRASH => sync::sys_fslog_crash(),
        _ => {
            log::warn!(
                "syscall: pid {} called unknown number {}",
                proc::current_pid().unwrap_or(-1),
                num
            );
            Err(KernelError::InvalidArgument { name: "syscall" })
        }
    };

    let ret = match result {
        Ok(v) => v,
        Err(_) => (-1i64) as usize,
    };
    proc::with_current(|p| p.trapframe_mut().a0 = ret);
}

// ---------------------------------------------------------------------
// Argument fetching
// ---------------------------------------------------------------------

/// Raw n-th argument register (a0..a5).
pub fn arg_raw(n: usize) -> usize {
    proc::with_current(|p| p.trapframe_mut().arg(n)).expect("argument fetch without a process")
}

/// n-th argument as a signed integer.
pub fn arg_int(n: usize) -> i64 {
    arg_raw(n) as i64
}

/// n-th argument as a user virtual address.
pub fn arg_addr(n: usize) -> usize {
    arg_raw(n)
}

/// Copy the NUL-terminated string named by the n-th argument into
/// `buf`. Returns its length.
pub fn arg_str(n: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let addr = arg_addr(n);
    let pt = proc::current_pagetable().ok_or(KernelError::BadAddress { addr })?;
    uvm::copy_in_str(&pt, buf, addr)
}

/// Interpret the n-th argument as a file descriptor and resolve it
/// through the calling process's descriptor table.
pub fn arg_fd(n: usize) -> KernelResult<(usize, FileRef)> {
    let fd = arg_raw(n);
    if fd >= NOFILE {
        return Err(crate::error::FsError::BadFileDescriptor.into());
    }
    let fref = proc::with_current(|p| p.ofile[fd])
        .flatten()
        .ok_or(crate::error::FsError::BadFileDescriptor)?;
    Ok((fd, fref))
}

/// Install an open file in the lowest free descriptor slot.
pub fn fd_alloc(fref: FileRef) -> KernelResult<usize> {
    proc::with_current(|p| {
        for (fd, slot) in p.ofile.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fref);
                return Ok(fd);
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "file descriptors",
        })
    })
    .expect("fd_alloc without a process")
}
