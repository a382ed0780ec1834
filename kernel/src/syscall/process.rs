//! Process system calls.

use crate::error::{KernelError, KernelResult};
use crate::mm::{frame, PhysAddr, PAGE_SIZE};
use crate::param::{MAXARG, MAXPATH};
use crate::proc::{self, lifecycle, loader};
use crate::syscall::{arg_addr, arg_int, arg_str};
use crate::trap::timer;

pub fn sys_fork() -> KernelResult<usize> {
    lifecycle::fork().map(|pid| pid as usize)
}

pub fn sys_exit() -> KernelResult<usize> {
    let status = arg_int(0) as i32;
    lifecycle::exit(status)
}

pub fn sys_wait() -> KernelResult<usize> {
    let status_va = arg_addr(0);
    lifecycle::wait(status_va).map(|pid| pid as usize)
}

pub fn sys_getpid() -> KernelResult<usize> {
    proc::current_pid()
        .map(|pid| pid as usize)
        .ok_or(KernelError::InvalidArgument { name: "no process" })
}

pub fn sys_sbrk() -> KernelResult<usize> {
    let delta = arg_int(0) as isize;
    lifecycle::grow(delta)
}

pub fn sys_sleep() -> KernelResult<usize> {
    let n = arg_int(0);
    if n < 0 {
        return Err(KernelError::InvalidArgument { name: "ticks" });
    }
    timer::sleep_ticks(n as u64)?;
    Ok(0)
}

pub fn sys_uptime() -> KernelResult<usize> {
    Ok(timer::ticks() as usize)
}

/// exec(path, argv): fetch the path and each argument string out of the
/// caller's address space (one frame per string), then hand off to the
/// loader. Returns argc so the dispatcher's write-back seeds the new
/// image's a0.
pub fn sys_exec() -> KernelResult<usize> {
    let mut path = [0u8; MAXPATH];
    let path_len = arg_str(0, &mut path)?;
    let uargv = arg_addr(1);

    let frames = frame::allocator();
    let mut pages: [Option<PhysAddr>; MAXARG] = [None; MAXARG];
    let mut lens = [0usize; MAXARG];
    let mut argc = 0;

    let fetch = (|| -> KernelResult<()> {
        let pt = proc::current_pagetable().ok_or(KernelError::BadAddress { addr: uargv })?;
        loop {
            if argc >= MAXARG {
                return Err(KernelError::InvalidArgument { name: "argv" });
            }
            let mut ptr_bytes = [0u8; 8];
            crate::mm::uvm::copy_in(&pt, &mut ptr_bytes, uargv + argc * 8)?;
            let str_va = u64::from_le_bytes(ptr_bytes) as usize;
            if str_va == 0 {
                return Ok(());
            }
            let page = frames.alloc()?;
            pages[argc] = Some(page);
            // SAFETY: a fresh frame is PAGE_SIZE writable bytes.
            let buf =
                unsafe { core::slice::from_raw_parts_mut(page.as_mut_ptr::<u8>(), PAGE_SIZE) };
            lens[argc] = crate::mm::uvm::copy_in_str(&pt, buf, str_va)?;
            argc += 1;
        }
    })();

    let result = fetch.and_then(|()| {
        let mut args: [&[u8]; MAXARG] = [&[]; MAXARG];
        for i in 0..argc {
            let page = pages[i].expect("fetched argument has a page");
            // SAFETY: the frame holds the copied string of lens[i] bytes.
            args[i] =
                unsafe { core::slice::from_raw_parts(page.as_ptr::<u8>(), lens[i]) };
        }
        loader::exec(&path[..path_len], &args[..argc])
    });

    for page in pages.into_iter().flatten() {
        frames.free(page);
    }
    result
}
