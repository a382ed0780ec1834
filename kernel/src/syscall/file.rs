//! Filesystem and file-descriptor system calls.

use crate::error::{FsError, KernelResult};
use crate::fs::{self, file, InodeType};
use crate::fs::file::OpenFlags;
use crate::param::MAXPATH;
use crate::proc;
use crate::syscall::{arg_addr, arg_fd, arg_int, arg_str, fd_alloc};

pub fn sys_open() -> KernelResult<usize> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;
    let flags = OpenFlags::from_bits_truncate(arg_int(1) as u32);

    let fsys = fs::fs();
    let cwd = proc::with_current(|p| p.cwd).flatten();
    let fref = file::table().open(fsys, &path[..len], flags, cwd)?;
    match fd_alloc(fref) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            file::table().close(fref, fsys);
            Err(e)
        }
    }
}

pub fn sys_close() -> KernelResult<usize> {
    let (fd, fref) = arg_fd(0)?;
    proc::with_current(|p| p.ofile[fd] = None);
    file::table().close(fref, fs::fs());
    Ok(0)
}

pub fn sys_read() -> KernelResult<usize> {
    let (_, fref) = arg_fd(0)?;
    let addr = arg_addr(1);
    let n = arg_int(2);
    if n < 0 {
        return Err(FsError::BadFileDescriptor.into());
    }
    file::table().read(fref, fs::fs(), true, addr, n as usize)
}

pub fn sys_write() -> KernelResult<usize> {
    let (_, fref) = arg_fd(0)?;
    let addr = arg_addr(1);
    let n = arg_int(2);
    if n < 0 {
        return Err(FsError::BadFileDescriptor.into());
    }
    file::table().write(fref, fs::fs(), true, addr, n as usize)
}

pub fn sys_fstat() -> KernelResult<usize> {
    let (_, fref) = arg_fd(0)?;
    let addr = arg_addr(1);
    file::table().stat(fref, fs::fs(), true, addr)?;
    Ok(0)
}

pub fn sys_mkdir() -> KernelResult<usize> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;

    let fsys = fs::fs();
    let cwd = proc::with_current(|p| p.cwd).flatten();
    fsys.log.begin_op(fsys);
    let made = fsys.create(&path[..len], InodeType::Dir, 0, 0, cwd);
    if let Ok(ip) = made {
        fsys.iput(ip);
    }
    fsys.log.end_op(fsys)?;
    made.map(|_| 0)
}

pub fn sys_link() -> KernelResult<usize> {
    let mut old = [0u8; MAXPATH];
    let old_len = arg_str(0, &mut old)?;
    let mut new = [0u8; MAXPATH];
    let new_len = arg_str(1, &mut new)?;

    let fsys = fs::fs();
    let cwd = proc::with_current(|p| p.cwd).flatten();
    fsys.log.begin_op(fsys);
    let linked = fsys.link(&old[..old_len], &new[..new_len], cwd);
    fsys.log.end_op(fsys)?;
    linked.map(|_| 0)
}

pub fn sys_unlink() -> KernelResult<usize> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;

    let fsys = fs::fs();
    let cwd = proc::with_current(|p| p.cwd).flatten();
    fsys.log.begin_op(fsys);
    let unlinked = fsys.unlink(&path[..len], cwd);
    fsys.log.end_op(fsys)?;
    unlinked.map(|_| 0)
}

pub fn sys_chdir() -> KernelResult<usize> {
    let mut path = [0u8; MAXPATH];
    let len = arg_str(0, &mut path)?;

    let fsys = fs::fs();
    let cwd = proc::with_current(|p| p.cwd).flatten();

    fsys.log.begin_op(fsys);
    let changed = (|| -> KernelResult<()> {
        let ip = fsys.namei(&path[..len], cwd)?;
        let guard = match fsys.ilock(ip) {
            Ok(g) => g,
            Err(e) => {
                fsys.iput(ip);
                return Err(e);
            }
        };
        if guard.typ != InodeType::Dir {
            drop(guard);
            fsys.iput(ip);
            return Err(FsError::NotADirectory.into());
        }
        drop(guard);
        if let Some(old) = cwd {
            fsys.iput(old);
        }
        proc::with_current(|p| p.cwd = Some(ip));
        Ok(())
    })();
    fsys.log.end_op(fsys)?;
    changed.map(|_| 0)
}

pub fn sys_pipe() -> KernelResult<usize> {
    let fd_array_va = arg_addr(0);
    let fsys = fs::fs();
    let ftable = file::table();

    let (read_end, write_end) = ftable.alloc_pipe()?;
    let rfd = match fd_alloc(read_end) {
        Ok(fd) => fd,
        Err(e) => {
            ftable.close(read_end, fsys);
            ftable.close(write_end, fsys);
            return Err(e);
        }
    };
    let wfd = match fd_alloc(write_end) {
        Ok(fd) => fd,
        Err(e) => {
            proc::with_current(|p| p.ofile[rfd] = None);
            ftable.close(read_end, fsys);
            ftable.close(write_end, fsys);
            return Err(e);
        }
    };

    let fds = [rfd as i32, wfd as i32];
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&fds[0].to_le_bytes());
    bytes[4..].copy_from_slice(&fds[1].to_le_bytes());
    if let Err(e) = proc::either_copy_out(true, fd_array_va, &bytes) {
        proc::with_current(|p| {
            p.ofile[rfd] = None;
            p.ofile[wfd] = None;
        });
        ftable.close(read_end, fsys);
        ftable.close(write_end, fsys);
        return Err(e);
    }
    Ok(0)
}

pub fn sys_sysinfo() -> KernelResult<usize> {
    let addr = arg_addr(0);
    let info = fs::fs().sysinfo()?;
    proc::either_copy_out(true, addr, info.as_bytes())?;
    Ok(0)
}
