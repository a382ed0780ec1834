//! Open files: the system-wide file table, the device switch, and the
//! uniform read/write/stat surface over inodes, devices, and pipes.
//!
//! Per-process descriptor tables hold [`FileRef`] handles into one
//! global table; `dup`/`fork` share a slot by reference count, and the
//! final close tears down the slot's payload (dropping the inode
//! reference or closing a pipe end).

use bitflags::bitflags;

use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::inode::InodeRef;
use crate::fs::pipe::Pipe;
use crate::fs::{FileSystem, InodeType, BSIZE};
use crate::mm::{frame, PhysAddr};
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
use crate::sync::spinlock::SpinLock;

bitflags! {
    /// open() mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR   = 0x002;
        const CREATE = 0x200;
        const TRUNC  = 0x400;
    }
}

impl OpenFlags {
    pub fn readable(&self) -> bool {
        !self.contains(Self::WRONLY)
    }

    pub fn writable(&self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// Device-switch entry: read/write handlers keyed by major number.
#[derive(Clone, Copy)]
pub struct DevSw {
    pub read: fn(bool, usize, usize) -> KernelResult<usize>,
    pub write: fn(bool, usize, usize) -> KernelResult<usize>,
}

static DEVSW: SpinLock<[Option<DevSw>; NDEV]> = SpinLock::new("devsw", [None; NDEV]);

/// Register a character device under a major number.
pub fn register_device(
    major: u16,
    read: fn(bool, usize, usize) -> KernelResult<usize>,
    write: fn(bool, usize, usize) -> KernelResult<usize>,
) {
    let mut devsw = DEVSW.lock();
    assert!(
        (major as usize) < NDEV && devsw[major as usize].is_none(),
        "device switch: bad or duplicate major {}",
        major
    );
    devsw[major as usize] = Some(DevSw { read, write });
}

fn device(major: i16) -> Option<DevSw> {
    if major < 0 || major as usize >= NDEV {
        return None;
    }
    DEVSW.lock()[major as usize]
}

/// What an open file refers to.
#[derive(Clone, Copy)]
enum FileKind {
    None,
    Pipe { pipe: &'static Pipe },
    Inode { iref: InodeRef },
    Device { iref: InodeRef, major: i16 },
}

#[derive(Clone, Copy)]
struct FileSlot {
    refcnt: u32,
    readable: bool,
    writable: bool,
    /// Byte offset, meaningful for inode files only.
    off: u32,
    kind: FileKind,
}

const FREE_SLOT: FileSlot = FileSlot {
    refcnt: 0,
    readable: false,
    writable: false,
    off: 0,
    kind: FileKind::None,
};

/// Handle into the open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef(usize);

/// The system-wide open-file table.
pub struct FileTable {
    slots: SpinLock<[FileSlot; NFILE]>,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            slots: SpinLock::new("ftable", [FREE_SLOT; NFILE]),
        }
    }

    fn alloc(&self, kind: FileKind, readable: bool, writable: bool) -> KernelResult<FileRef> {
        let mut slots = self.slots.lock();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.refcnt == 0 {
                *slot = FileSlot {
                    refcnt: 1,
                    readable,
                    writable,
                    off: 0,
                    kind,
                };
                return Ok(FileRef(i));
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "open files",
        })
    }

    fn snapshot(&self, f: FileRef) -> KernelResult<FileSlot> {
        let slots = self.slots.lock();
        let slot = slots[f.0];
        if slot.refcnt == 0 {
            return Err(FsError::BadFileDescriptor.into());
        }
        Ok(slot)
    }

    /// Share the open file: refcount up, same handle back.
    pub fn dup(&self, f: FileRef) -> FileRef {
        let mut slots = self.slots.lock();
        assert!(slots[f.0].refcnt > 0, "file dup: dead slot");
        slots[f.0].refcnt += 1;
        f
    }

    /// Drop one reference; the last one tears down the payload.
    pub fn close(&self, f: FileRef, fs: &FileSystem) {
        let slot = {
            let mut slots = self.slots.lock();
            assert!(slots[f.0].refcnt > 0, "file close: dead slot");
            slots[f.0].refcnt -= 1;
            if slots[f.0].refcnt > 0 {
                return;
            }
            let copy = slots[f.0];
            slots[f.0] = FREE_SLOT;
            copy
        };

        match slot.kind {
            FileKind::None => {}
            FileKind::Pipe { pipe } => {
                if pipe.close(slot.writable) {
                    // Both ends gone: reclaim the pipe's frame.
                    let pa = PhysAddr::new(pipe as *const Pipe as usize);
                    // SAFETY: the pipe was placement-constructed in a
                    // frame by alloc_pipe and no references remain.
                    unsafe { core::ptr::drop_in_place(pipe as *const Pipe as *mut Pipe) };
                    frame::allocator().free(pa);
                }
            }
            FileKind::Inode { iref } | FileKind::Device { iref, .. } => {
                // The drop of the inode reference may free the inode's
                // storage, which must be inside a transaction.
                fs.log.begin_op(fs);
                fs.iput(iref);
                let _ = fs.log.end_op(fs);
            }
        }
    }

    /// Open (or create) the file at `path`.
    pub fn open(
        &self,
        fs: &FileSystem,
        path: &[u8],
        flags: OpenFlags,
        cwd: Option<InodeRef>,
    ) -> KernelResult<FileRef> {
        fs.log.begin_op(fs);
        let result = self.open_locked(fs, path, flags, cwd);
        fs.log.end_op(fs)?;
        result
    }

    fn open_locked(
        &self,
        fs: &FileSystem,
        path: &[u8],
        flags: OpenFlags,
        cwd: Option<InodeRef>,
    ) -> KernelResult<FileRef> {
        let iref = if flags.contains(OpenFlags::CREATE) {
            fs.create(path, InodeType::File, 0, 0, cwd)?
        } else {
            fs.namei(path, cwd)?
        };

        let mut guard = match fs.ilock(iref) {
            Ok(g) => g,
            Err(e) => {
                fs.iput(iref);
                return Err(e);
            }
        };

        if guard.typ == InodeType::Dir && flags.writable() {
            drop(guard);
            fs.iput(iref);
            return Err(FsError::IsADirectory.into());
        }

        let kind = match guard.typ {
            InodeType::Device => {
                let major = guard.major;
                if device(major).is_none() {
                    drop(guard);
                    fs.iput(iref);
                    return Err(KernelError::InvalidArgument { name: "major" });
                }
                FileKind::Device { iref, major }
            }
            _ => FileKind::Inode { iref },
        };

        if flags.contains(OpenFlags::TRUNC) && guard.typ == InodeType::File {
            guard.truncate()?;
        }
        drop(guard);

        match self.alloc(kind, flags.readable(), flags.writable()) {
            Ok(f) => Ok(f),
            Err(e) => {
                fs.iput(iref);
                Err(e)
            }
        }
    }

    /// Create a connected pipe; returns (read end, write end).
    pub fn alloc_pipe(&self) -> KernelResult<(FileRef, FileRef)> {
        let frame = frame::allocator().alloc()?;
        // SAFETY: a Pipe fits comfortably in one zeroed frame; the frame
        // is exclusively ours until registered in the table.
        let pipe: &'static Pipe = unsafe {
            let p = frame.as_mut_ptr::<Pipe>();
            p.write(Pipe::new());
            &*p
        };

        let read_end = match self.alloc(FileKind::Pipe { pipe }, true, false) {
            Ok(f) => f,
            Err(e) => {
                frame::allocator().free(frame);
                return Err(e);
            }
        };
        let write_end = match self.alloc(FileKind::Pipe { pipe }, false, true) {
            Ok(f) => f,
            Err(e) => {
                // Closing the read end reclaims the frame once the never-
                // opened write side is accounted closed.
                pipe.close(true);
                self.close_pipe_only(read_end);
                return Err(e);
            }
        };
        Ok((read_end, write_end))
    }

    /// Close used during pipe-creation unwinding (no filesystem in
    /// play).
    fn close_pipe_only(&self, f: FileRef) {
        let slot = {
            let mut slots = self.slots.lock();
            let copy = slots[f.0];
            slots[f.0] = FREE_SLOT;
            copy
        };
        if let FileKind::Pipe { pipe } = slot.kind {
            if pipe.close(slot.writable) {
                let pa = PhysAddr::new(pipe as *const Pipe as usize);
                // SAFETY: both ends closed; no references remain.
                unsafe { core::ptr::drop_in_place(pipe as *const Pipe as *mut Pipe) };
                frame::allocator().free(pa);
            }
        }
    }

    /// Read from an open file into user or kernel memory.
    pub fn read(
        &self,
        f: FileRef,
        fs: &FileSystem,
        user: bool,
        addr: usize,
        n: usize,
    ) -> KernelResult<usize> {
        let slot = self.snapshot(f)?;
        if !slot.readable {
            return Err(FsError::NotOpenForThat.into());
        }
        match slot.kind {
            FileKind::None => Err(FsError::BadFileDescriptor.into()),
            FileKind::Pipe { pipe } => pipe.read(user, addr, n),
            FileKind::Device { major, .. } => {
                let dev = device(major).ok_or(KernelError::InvalidArgument { name: "major" })?;
                (dev.read)(user, addr, n)
            }
            FileKind::Inode { iref } => {
                let mut guard = fs.ilock(iref)?;
                let got = guard.read(user, addr, slot.off, n)?;
                drop(guard);
                self.slots.lock()[f.0].off += got as u32;
                Ok(got)
            }
        }
    }

    /// Write to an open file from user or kernel memory.
    ///
    /// Inode writes are split across several log transactions so one
    /// large write cannot overflow the log region.
    pub fn write(
        &self,
        f: FileRef,
        fs: &FileSystem,
        user: bool,
        addr: usize,
        n: usize,
    ) -> KernelResult<usize> {
        let slot = self.snapshot(f)?;
        if !slot.writable {
            return Err(FsError::NotOpenForThat.into());
        }
        match slot.kind {
            FileKind::None => Err(FsError::BadFileDescriptor.into()),
            FileKind::Pipe { pipe } => pipe.write(user, addr, n),
            FileKind::Device { major, .. } => {
                let dev = device(major).ok_or(KernelError::InvalidArgument { name: "major" })?;
                (dev.write)(user, addr, n)
            }
            FileKind::Inode { iref } => {
                // Budget per transaction: a block of data may also dirty
                // the bitmap, the indirect block, and the inode block.
                let max = ((MAXOPBLOCKS - 4) / 2) * BSIZE;
                let mut done = 0;
                while done < n {
                    let chunk = max.min(n - done);
                    fs.log.begin_op(fs);
                    let wrote = (|| {
                        let mut guard = fs.ilock(iref)?;
                        let off = self.slots.lock()[f.0].off;
                        guard.write(user, addr + done, off, chunk)
                    })();
                    fs.log.end_op(fs)?;
                    let wrote = wrote?;
                    self.slots.lock()[f.0].off += wrote as u32;
                    done += wrote;
                    if wrote < chunk {
                        break;
                    }
                }
                if done == n {
                    Ok(n)
                } else {
                    Err(KernelError::BadAddress { addr: addr + done })
                }
            }
        }
    }

    /// Copy a stat record for the open file to `addr`.
    pub fn stat(&self, f: FileRef, fs: &FileSystem, user: bool, addr: usize) -> KernelResult<()> {
        let slot = self.snapshot(f)?;
        match slot.kind {
            FileKind::Inode { iref } | FileKind::Device { iref, .. } => {
                let guard = fs.ilock(iref)?;
                let st = guard.stat();
                drop(guard);
                crate::proc::either_copy_out(user, addr, st.as_bytes())
            }
            _ => Err(FsError::BadFileDescriptor.into()),
        }
    }

    /// The inode behind an open inode file (diagnostics/tests).
    pub fn inode_of(&self, f: FileRef) -> Option<InodeRef> {
        let slots = self.slots.lock();
        match slots[f.0].kind {
            FileKind::Inode { iref } | FileKind::Device { iref, .. } => Some(iref),
            _ => None,
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Global open-file table backing the file descriptor syscalls.
static FILE_TABLE: FileTable = FileTable::new();

/// The global open-file table.
pub fn table() -> &'static FileTable {
    &FILE_TABLE
}
