//! Compile-time kernel tunables.
//!
//! Every fixed-size table in the kernel is dimensioned here. Changing a
//! value requires a matching filesystem image when it affects the on-disk
//! layout (`FSSIZE`, `LOGBLOCKS`).

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files system-wide.
pub const NFILE: usize = 100;

/// In-memory inode cache slots.
pub const NINODE: usize = 50;

/// Major device numbers the device switch table covers.
pub const NDEV: usize = 10;

/// Device number of the root filesystem disk.
pub const ROOTDEV: u32 = 1;

/// Maximum data blocks any single filesystem operation may dirty.
pub const MAXOPBLOCKS: usize = 10;

/// Data blocks in the on-disk log region (excluding the header block).
pub const LOGBLOCKS: usize = MAXOPBLOCKS * 3;

/// Block buffers in the cache.
pub const NBUF: usize = 30;

/// Total blocks in the filesystem image.
pub const FSSIZE: usize = 2000;

/// Maximum path length accepted by the syscall layer.
pub const MAXPATH: usize = 128;

/// Maximum exec() arguments.
pub const MAXARG: usize = 32;

/// Counting semaphores available through sem_open.
pub const NSEM: usize = 64;

/// Pipe buffer capacity in bytes.
pub const PIPESIZE: usize = 512;

/// Console input line buffer size.
pub const INPUT_BUF: usize = 128;
