//! Inodes: the on-disk inode table, its in-memory cache, and the
//! data-block bitmap.
//!
//! An [`InodeRef`] is a counted reference to a cache slot; it keeps the
//! slot from being recycled but grants no access to the inode's fields.
//! Locking the reference yields an [`InodeGuard`], which loads the
//! on-disk inode on first use and serializes every mutation of the
//! inode's metadata and block map.
//!
//! Dropping the last reference to an unlinked inode frees its storage
//! and returns the on-disk slot; callers must therefore hold a log
//! transaction across any `iput` that could be the last.

use core::ops::{Deref, DerefMut};

use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::{
    FileSystem, InodeType, Stat, BPB, BSIZE, DINODE_SIZE, IPB, MAXFILE, NDIRECT, NINDIRECT,
};
use crate::param::NINODE;
use crate::proc;
use crate::sync::sleeplock::{SleepLock, SleepLockGuard};
use crate::sync::spinlock::SpinLock;

/// Cached copy of an on-disk inode's fields.
pub struct InodeData {
    pub typ: InodeType,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    /// NDIRECT direct block numbers plus one indirect block number.
    pub addrs: [u32; NDIRECT + 1],
}

impl InodeData {
    const fn empty() -> Self {
        Self {
            typ: InodeType::Free,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    fn decode(raw: &[u8]) -> Self {
        let i16_at = |o: usize| i16::from_le_bytes(raw[o..o + 2].try_into().unwrap());
        let mut addrs = [0u32; NDIRECT + 1];
        for (i, a) in addrs.iter_mut().enumerate() {
            *a = u32::from_le_bytes(raw[12 + i * 4..16 + i * 4].try_into().unwrap());
        }
        Self {
            typ: InodeType::from_disk(i16_at(0)),
            major: i16_at(2),
            minor: i16_at(4),
            nlink: i16_at(6),
            size: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            addrs,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        out[..2].copy_from_slice(&(self.typ as i16).to_le_bytes());
        out[2..4].copy_from_slice(&self.major.to_le_bytes());
        out[4..6].copy_from_slice(&self.minor.to_le_bytes());
        out[6..8].copy_from_slice(&self.nlink.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        for (i, a) in self.addrs.iter().enumerate() {
            out[12 + i * 4..16 + i * 4].copy_from_slice(&a.to_le_bytes());
        }
    }
}

#[derive(Clone, Copy)]
struct InodeMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
    /// On-disk fields have been loaded into the slot.
    valid: bool,
}

/// Fixed-size cache of in-memory inodes keyed by (device, inode number).
pub struct InodeCache {
    ctl: SpinLock<[InodeMeta; NINODE]>,
    slots: [SleepLock<InodeData>; NINODE],
}

impl InodeCache {
    pub fn new() -> Self {
        Self {
            ctl: SpinLock::new(
                "itable",
                [InodeMeta {
                    dev: 0,
                    inum: 0,
                    refcnt: 0,
                    valid: false,
                }; NINODE],
            ),
            slots: [const { SleepLock::new("inode", InodeData::empty()) }; NINODE],
        }
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A counted reference to a cached inode. Plain data, like a C pointer:
/// duplicating the reference count is always explicit via
/// [`FileSystem::idup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeRef {
    pub(crate) idx: usize,
    pub dev: u32,
    pub inum: u32,
}

/// A locked inode: the sleep lock is held and the cached fields are
/// loaded. Dropping the guard unlocks without touching the refcount.
pub struct InodeGuard<'a> {
    pub(crate) fs: &'a FileSystem,
    pub(crate) iref: InodeRef,
    data: SleepLockGuard<'a, InodeData>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeData;

    fn deref(&self) -> &InodeData {
        &self.data
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut InodeData {
        &mut self.data
    }
}

impl FileSystem {
    // -- data-block bitmap ------------------------------------------------

    /// Allocate a zeroed data block: first clear bit in the bitmap.
    pub(crate) fn balloc(&self) -> KernelResult<u32> {
        let mut base = 0u32;
        while base < self.sb.size {
            let mut buf = self.cache.bread(self.dev, self.sb.bitmap_block(base))?;
            let limit = (BPB as u32).min(self.sb.size - base);
            for bi in 0..limit as usize {
                let mask = 1u8 << (bi % 8);
                if buf.data()[bi / 8] & mask == 0 {
                    buf.data_mut()[bi / 8] |= mask;
                    self.log.write(self, &buf);
                    drop(buf);
                    let b = base + bi as u32;
                    self.bzero(b)?;
                    return Ok(b);
                }
            }
            base += BPB as u32;
        }
        Err(FsError::NoFreeBlocks.into())
    }

    /// Zero a freshly allocated data block, through the log.
    fn bzero(&self, b: u32) -> KernelResult<()> {
        let mut buf = self.cache.bread(self.dev, b)?;
        buf.data_mut().fill(0);
        self.log.write(self, &buf);
        Ok(())
    }

    /// Return a data block to the bitmap. Freeing a free block is fatal.
    pub(crate) fn bfree(&self, b: u32) -> KernelResult<()> {
        let mut buf = self.cache.bread(self.dev, self.sb.bitmap_block(b))?;
        let bi = b as usize % BPB;
        let mask = 1u8 << (bi % 8);
        if buf.data()[bi / 8] & mask == 0 {
            panic!("bfree: freeing free block {}", b);
        }
        buf.data_mut()[bi / 8] &= !mask;
        self.log.write(self, &buf);
        Ok(())
    }

    // -- inode allocation and cache ---------------------------------------

    /// Allocate an on-disk inode of the given type and return a
    /// reference to it.
    pub fn ialloc(&self, typ: InodeType) -> KernelResult<InodeRef> {
        for inum in 1..self.sb.ninodes {
            let mut buf = self.cache.bread(self.dev, self.sb.inode_block(inum))?;
            let off = (inum as usize % IPB) * DINODE_SIZE;
            let raw_type = i16::from_le_bytes(buf.data()[off..off + 2].try_into().unwrap());
            if raw_type == 0 {
                let slot = &mut buf.data_mut()[off..off + DINODE_SIZE];
                slot.fill(0);
                slot[..2].copy_from_slice(&(typ as i16).to_le_bytes());
                self.log.write(self, &buf);
                drop(buf);
                return self.iget(self.dev, inum);
            }
        }
        Err(FsError::NoFreeInodes.into())
    }

    /// Find or create a cache slot for (dev, inum); no disk access.
    pub fn iget(&self, dev: u32, inum: u32) -> KernelResult<InodeRef> {
        let mut ctl = self.itable.ctl.lock();
        let mut empty = None;
        for (i, m) in ctl.iter_mut().enumerate() {
            if m.refcnt > 0 && m.dev == dev && m.inum == inum {
                m.refcnt += 1;
                return Ok(InodeRef { idx: i, dev, inum });
            }
            if empty.is_none() && m.refcnt == 0 {
                empty = Some(i);
            }
        }
        let idx = empty.ok_or(KernelError::ResourceExhausted {
            resource: "inode cache",
        })?;
        ctl[idx] = InodeMeta {
            dev,
            inum,
            refcnt: 1,
            valid: false,
        };
        Ok(InodeRef { idx, dev, inum })
    }

    /// Take another reference to a cached inode.
    pub fn idup(&self, iref: InodeRef) -> InodeRef {
        self.itable.ctl.lock()[iref.idx].refcnt += 1;
        iref
    }

    /// Lock an inode, reading its on-disk fields on first use.
    pub fn ilock(&self, iref: InodeRef) -> KernelResult<InodeGuard<'_>> {
        debug_assert!(self.itable.ctl.lock()[iref.idx].refcnt > 0, "ilock: dangling ref");
        let mut data = self.itable.slots[iref.idx].lock();
        let valid = self.itable.ctl.lock()[iref.idx].valid;
        if !valid {
            let buf = self.cache.bread(iref.dev, self.sb.inode_block(iref.inum))?;
            let off = (iref.inum as usize % IPB) * DINODE_SIZE;
            *data = InodeData::decode(&buf.data()[off..off + DINODE_SIZE]);
            drop(buf);
            self.itable.ctl.lock()[iref.idx].valid = true;
            if data.typ == InodeType::Free {
                panic!("ilock: unallocated inode {}", iref.inum);
            }
        }
        Ok(InodeGuard {
            fs: self,
            iref,
            data,
        })
    }

    /// Drop a reference. When the last reference to an unlinked, loaded
    /// inode goes away, its storage is truncated and the on-disk slot
    /// freed; the caller must be inside a log transaction.
    pub fn iput(&self, iref: InodeRef) {
        let mut ctl = self.itable.ctl.lock();
        let idx = iref.idx;
        if ctl[idx].refcnt == 1 && ctl[idx].valid {
            // refcnt == 1 means nobody else can hold the sleep lock, so
            // this acquire cannot block.
            let data = self.itable.slots[idx].lock();
            if data.nlink == 0 {
                drop(ctl);
                let mut guard = InodeGuard {
                    fs: self,
                    iref,
                    data,
                };
                guard
                    .truncate()
                    .expect("iput: truncate of unlinked inode failed");
                guard.typ = InodeType::Free;
                guard
                    .update()
                    .expect("iput: freeing on-disk inode failed");
                drop(guard);
                let mut ctl = self.itable.ctl.lock();
                ctl[idx].valid = false;
                ctl[idx].refcnt -= 1;
                return;
            }
            drop(data);
        }
        assert!(ctl[idx].refcnt > 0, "iput: refcount underflow");
        ctl[idx].refcnt -= 1;
    }
}

impl InodeGuard<'_> {
    /// Write the cached fields back to the on-disk inode, through the
    /// log.
    pub fn update(&mut self) -> KernelResult<()> {
        let fs = self.fs;
        let mut buf = fs
            .cache
            .bread(self.iref.dev, fs.sb.inode_block(self.iref.inum))?;
        let off = (self.iref.inum as usize % IPB) * DINODE_SIZE;
        self.data.encode(&mut buf.data_mut()[off..off + DINODE_SIZE]);
        fs.log.write(fs, &buf);
        Ok(())
    }

    /// Physical block for logical block `bn`, without allocating.
    /// Returns 0 for a hole.
    fn block_lookup(&self, bn: usize) -> KernelResult<u32> {
        if bn < NDIRECT {
            return Ok(self.addrs[bn]);
        }
        let bn = bn - NDIRECT;
        if bn >= NINDIRECT {
            panic!("inode block map: logical block out of range");
        }
        let ind = self.addrs[NDIRECT];
        if ind == 0 {
            return Ok(0);
        }
        let buf = self.fs.cache.bread(self.iref.dev, ind)?;
        Ok(u32::from_le_bytes(
            buf.data()[bn * 4..bn * 4 + 4].try_into().unwrap(),
        ))
    }

    /// Physical block for logical block `bn`, allocating the data block
    /// (and the indirect block) on demand.
    fn block_alloc(&mut self, bn: usize) -> KernelResult<u32> {
        if bn < NDIRECT {
            if self.addrs[bn] == 0 {
                self.addrs[bn] = self.fs.balloc()?;
            }
            return Ok(self.addrs[bn]);
        }
        let idx = bn - NDIRECT;
        if idx >= NINDIRECT {
            panic!("inode block map: logical block out of range");
        }
        if self.addrs[NDIRECT] == 0 {
            self.addrs[NDIRECT] = self.fs.balloc()?;
        }
        let ind = self.addrs[NDIRECT];
        let mut buf = self.fs.cache.bread(self.iref.dev, ind)?;
        let slot = idx * 4;
        let mut b = u32::from_le_bytes(buf.data()[slot..slot + 4].try_into().unwrap());
        if b == 0 {
            b = self.fs.balloc()?;
            buf.data_mut()[slot..slot + 4].copy_from_slice(&b.to_le_bytes());
            self.fs.log.write(self.fs, &buf);
        }
        Ok(b)
    }

    /// Free every data block and reset the size to zero.
    pub fn truncate(&mut self) -> KernelResult<()> {
        for i in 0..NDIRECT {
            if self.addrs[i] != 0 {
                self.fs.bfree(self.addrs[i])?;
                self.addrs[i] = 0;
            }
        }
        if self.addrs[NDIRECT] != 0 {
            let ind = self.addrs[NDIRECT];
            {
                let buf = self.fs.cache.bread(self.iref.dev, ind)?;
                for i in 0..NINDIRECT {
                    let b = u32::from_le_bytes(buf.data()[i * 4..i * 4 + 4].try_into().unwrap());
                    if b != 0 {
                        self.fs.bfree(b)?;
                    }
                }
            }
            self.fs.bfree(ind)?;
            self.addrs[NDIRECT] = 0;
        }
        self.size = 0;
        self.update()
    }

    /// Read up to `n` bytes at byte offset `off` into user or kernel
    /// memory. Bounded by the file size; holes read as zeroes.
    pub fn read(&mut self, user_dst: bool, mut dst: usize, off: u32, n: usize) -> KernelResult<usize> {
        if off > self.size {
            return Ok(0);
        }
        let mut off = off as usize;
        let n = n.min(self.size as usize - off);
        let mut done = 0;
        while done < n {
            let chunk = (BSIZE - off % BSIZE).min(n - done);
            let b = self.block_lookup(off / BSIZE)?;
            if b == 0 {
                // Hole: unwritten region reads back as zeroes.
                let zeroes = [0u8; 32];
                let mut left = chunk;
                let mut d = dst;
                while left > 0 {
                    let step = left.min(zeroes.len());
                    proc::either_copy_out(user_dst, d, &zeroes[..step])?;
                    d += step;
                    left -= step;
                }
            } else {
                let buf = self.fs.cache.bread(self.iref.dev, b)?;
                proc::either_copy_out(user_dst, dst, &buf.data()[off % BSIZE..off % BSIZE + chunk])?;
            }
            done += chunk;
            off += chunk;
            dst += chunk;
        }
        Ok(done)
    }

    /// Write `n` bytes at byte offset `off` from user or kernel memory,
    /// growing the file as needed. Every touched block goes through the
    /// log, so the caller must be inside a transaction.
    pub fn write(&mut self, user_src: bool, mut src: usize, off: u32, n: usize) -> KernelResult<usize> {
        if off > self.size {
            return Err(KernelError::InvalidArgument { name: "offset" });
        }
        if off as usize + n > MAXFILE * BSIZE {
            return Err(FsError::FileTooLarge.into());
        }
        let mut off = off as usize;
        let mut done = 0;
        while done < n {
            let chunk = (BSIZE - off % BSIZE).min(n - done);
            let b = self.block_alloc(off / BSIZE)?;
            let mut buf = self.fs.cache.bread(self.iref.dev, b)?;
            let start = off % BSIZE;
            if proc::either_copy_in(user_src, &mut buf.data_mut()[start..start + chunk], src)
                .is_err()
            {
                break;
            }
            self.fs.log.write(self.fs, &buf);
            drop(buf);
            done += chunk;
            off += chunk;
            src += chunk;
        }
        if off > self.size as usize {
            self.size = off as u32;
        }
        // Persist size and any new block pointers even on a short write.
        self.update()?;
        Ok(done)
    }

    /// Identity record for the stat syscall.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.iref.dev as i32,
            ino: self.iref.inum,
            typ: self.typ as i16,
            nlink: self.nlink,
            size: self.size as u64,
        }
    }
}
