//! On-disk filesystem.
//!
//! Layout, block 0 upward:
//!
//! ```text
//! [ boot | super | log header + log data | inodes | bitmap | data ]
//! ```
//!
//! The stack, bottom to top: a block device ([`blockdev`]), a bounded
//! LRU buffer cache with per-buffer sleep locks ([`buffer`]), a
//! write-ahead log giving every filesystem operation crash atomicity
//! ([`log`]), the inode layer with its data-block bitmap ([`inode`]),
//! directories and path resolution ([`dir`]), and the open-file objects
//! shared by file descriptors ([`file`], [`pipe`]).
//!
//! All of it hangs off [`FileSystem`], created once at boot by
//! [`init`]; hosted tests build private instances over a RAM disk.

pub mod blockdev;
pub mod buffer;
pub mod dir;
pub mod file;
pub mod inode;
pub mod log;
pub mod pipe;

#[cfg(not(target_os = "none"))]
pub mod testing;

use spin::Once;

use crate::error::{FsError, KernelResult};
use crate::mm::FrameAllocator;
use crate::param::ROOTDEV;

use blockdev::BlockDevice;
use buffer::BufferCache;
use inode::InodeCache;
use log::Log;

/// Filesystem block size in bytes.
pub const BSIZE: usize = 1024;

/// Superblock magic number.
pub const FSMAGIC: u32 = 0x8888_8888;

/// Inode number of the root directory.
pub const ROOT_INO: u32 = 1;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 12;

/// Block pointers in the single indirect block.
pub const NINDIRECT: usize = BSIZE / 4;

/// Maximum file length in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Bytes per on-disk inode.
pub const DINODE_SIZE: usize = 64;

/// Inodes per block.
pub const IPB: usize = BSIZE / DINODE_SIZE;

/// Bitmap bits per block.
pub const BPB: usize = BSIZE * 8;

/// Directory entry name width.
pub const DIRSIZ: usize = 14;

/// Bytes per directory entry.
pub const DIRENT_SIZE: usize = 16;

/// File/inode types as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum InodeType {
    Free = 0,
    Dir = 1,
    File = 2,
    Device = 3,
}

impl InodeType {
    pub fn from_disk(raw: i16) -> Self {
        match raw {
            1 => Self::Dir,
            2 => Self::File,
            3 => Self::Device,
            _ => Self::Free,
        }
    }
}

/// The superblock: the on-disk record of the layout, read once at mount
/// and never modified at runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct Superblock {
    /// Must equal [`FSMAGIC`].
    pub magic: u32,
    /// Total blocks in the image.
    pub size: u32,
    /// Data blocks.
    pub nblocks: u32,
    /// On-disk inodes.
    pub ninodes: u32,
    /// Blocks in the log region (header + data slots).
    pub nlog: u32,
    /// First block of the log region.
    pub logstart: u32,
    /// First block of the inode region.
    pub inodestart: u32,
    /// First block of the bitmap.
    pub bmapstart: u32,
}

impl Superblock {
    /// Decode from the first 32 bytes of the superblock block.
    pub fn decode(raw: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        Self {
            magic: word(0),
            size: word(1),
            nblocks: word(2),
            ninodes: word(3),
            nlog: word(4),
            logstart: word(5),
            inodestart: word(6),
            bmapstart: word(7),
        }
    }

    /// Encode into the start of a block buffer.
    pub fn encode(&self, out: &mut [u8]) {
        for (i, v) in [
            self.magic,
            self.size,
            self.nblocks,
            self.ninodes,
            self.nlog,
            self.logstart,
            self.inodestart,
            self.bmapstart,
        ]
        .iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Block holding inode `inum`.
    pub fn inode_block(&self, inum: u32) -> u32 {
        self.inodestart + inum / IPB as u32
    }

    /// Bitmap block covering data block `b`.
    pub fn bitmap_block(&self, b: u32) -> u32 {
        self.bmapstart + b / BPB as u32
    }
}

/// `stat` record copied to user space, field-for-field the on-disk
/// inode's identity.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub dev: i32,
    pub ino: u32,
    pub typ: i16,
    pub nlink: i16,
    pub size: u64,
}

impl Stat {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: Stat is repr(C) plain old data; exposing its bytes for
        // copyout cannot produce invalid values.
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}

/// `sysinfo` record: filesystem capacity accounting.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SysInfo {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

impl SysInfo {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: as for Stat.
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}

/// One mounted filesystem: device, superblock, buffer cache, log, and
/// inode cache.
pub struct FileSystem {
    /// Device number this filesystem answers to (the root disk).
    pub(crate) dev: u32,
    pub(crate) sb: Superblock,
    pub(crate) cache: BufferCache,
    /// The write-ahead log; callers bracket operations with
    /// `log.begin_op` / `log.end_op`.
    pub log: Log,
    pub(crate) itable: InodeCache,
}

impl core::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileSystem").field("dev", &self.dev).finish()
    }
}

impl FileSystem {
    /// Mount: build the buffer cache, read and validate the superblock,
    /// then run log recovery.
    pub fn mount(
        dev: u32,
        disk: &'static dyn BlockDevice,
        frames: &'static FrameAllocator,
    ) -> KernelResult<Self> {
        let cache = BufferCache::new(disk, frames)?;

        // The superblock is always block 1 (block 0 is the boot block).
        let sb = {
            let buf = cache.bread(dev, 1)?;
            Superblock::decode(buf.data())
        };
        if sb.magic != FSMAGIC {
            return Err(FsError::BadMagic.into());
        }

        let fs = Self {
            dev,
            sb,
            cache,
            log: Log::new(sb.logstart, sb.nlog.saturating_sub(1)),
            itable: InodeCache::new(),
        };
        fs.log.recover(&fs)?;

        ::log::info!(
            "fs: mounted dev {}: {} blocks ({} data), {} inodes, log at {}+{}",
            dev,
            fs.sb.size,
            fs.sb.nblocks,
            fs.sb.ninodes,
            fs.sb.logstart,
            fs.sb.nlog
        );
        Ok(fs)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Capacity accounting for the sysinfo syscall: walk the bitmap for
    /// free data blocks and the inode region for free inodes.
    pub fn sysinfo(&self) -> KernelResult<SysInfo> {
        let data_start = self.data_start();
        let mut free_blocks = 0u64;
        let mut b = data_start;
        while b < self.sb.size {
            let buf = self.cache.bread(self.dev, self.sb.bitmap_block(b))?;
            let within = (b as usize) % BPB;
            let limit = (BPB - within).min((self.sb.size - b) as usize);
            for i in 0..limit {
                let bit = within + i;
                if buf.data()[bit / 8] & (1 << (bit % 8)) == 0 {
                    free_blocks += 1;
                }
            }
            b += limit as u32;
        }

        let mut free_inodes = 0u64;
        for inum in 1..self.sb.ninodes {
            let buf = self.cache.bread(self.dev, self.sb.inode_block(inum))?;
            let off = (inum as usize % IPB) * DINODE_SIZE;
            let typ = i16::from_le_bytes(buf.data()[off..off + 2].try_into().unwrap());
            if typ == 0 {
                free_inodes += 1;
            }
        }

        Ok(SysInfo {
            total_blocks: self.sb.nblocks as u64,
            free_blocks,
            total_inodes: self.sb.ninodes as u64,
            free_inodes,
        })
    }

    /// First data block (everything below is layout metadata).
    pub(crate) fn data_start(&self) -> u32 {
        let ninodeblocks = self.sb.ninodes.div_ceil(IPB as u32);
        let nbitmap = self.sb.size.div_ceil(BPB as u32);
        2 + self.sb.nlog + ninodeblocks + nbitmap
    }
}

/// The mounted root filesystem.
static FS: Once<FileSystem> = Once::new();

/// Mount the root filesystem at boot. Runs before the scheduler, so the
/// block driver busy-polls its completions.
pub fn init(disk: &'static dyn BlockDevice, frames: &'static FrameAllocator) {
    let fs = FileSystem::mount(ROOTDEV, disk, frames).expect("fs: root mount failed");
    FS.call_once(|| fs);
}

/// The root filesystem (valid after [`init`]).
pub fn fs() -> &'static FileSystem {
    FS.get().expect("fs: used before mount")
}
