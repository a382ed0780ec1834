//! Block buffer cache.
//!
//! A fixed pool of [`crate::param::NBUF`] buffers, each holding one disk
//! block in a dedicated frame. Lookup and the LRU list are guarded by a
//! spinlock; each buffer's contents are serialized by a sleep lock held
//! for the lifetime of a [`BufGuard`]. Reads are lazy: a reclaimed
//! buffer is marked invalid and filled from disk only when first locked.
//!
//! The LRU list is doubly linked through index arrays with a sentinel,
//! ordered most-recently-released first; reclaim scans from the tail.

use crate::error::KernelResult;
use crate::fs::blockdev::BlockDevice;
use crate::fs::BSIZE;
use crate::mm::{FrameAllocator, PhysAddr};
use crate::param::NBUF;
use crate::sync::sleeplock::{SleepLock, SleepLockGuard};
use crate::sync::spinlock::SpinLock;

/// Sentinel index for the LRU list head.
const HEAD: usize = NBUF;

struct BufMeta {
    dev: u32,
    blockno: u32,
    /// Contents reflect the disk block.
    valid: bool,
    /// Holders: guards plus log pins.
    refcnt: u32,
    /// Frame holding the block data.
    data: PhysAddr,
    prev: usize,
    next: usize,
}

struct CacheCtl {
    meta: [BufMeta; NBUF],
    /// Sentinel links: head_next is the MRU end, head_prev the LRU end.
    head_next: usize,
    head_prev: usize,
}

impl CacheCtl {
    /// Unlink `idx` and reinsert it right after the sentinel (MRU end).
    fn move_to_front(&mut self, idx: usize) {
        // Unlink.
        let (prev, next) = (self.meta[idx].prev, self.meta[idx].next);
        if prev == HEAD {
            self.head_next = next;
        } else {
            self.meta[prev].next = next;
        }
        if next == HEAD {
            self.head_prev = prev;
        } else {
            self.meta[next].prev = prev;
        }
        // Reinsert at front.
        let old_front = self.head_next;
        self.meta[idx].prev = HEAD;
        self.meta[idx].next = old_front;
        if old_front == HEAD {
            self.head_prev = idx;
        } else {
            self.meta[old_front].prev = idx;
        }
        self.head_next = idx;
    }
}

/// The buffer cache.
pub struct BufferCache {
    disk: &'static dyn BlockDevice,
    ctl: SpinLock<CacheCtl>,
    locks: [SleepLock<()>; NBUF],
}

impl BufferCache {
    /// Allocate the buffer pool: one data frame per buffer, all linked
    /// into the free LRU list.
    pub fn new(
        disk: &'static dyn BlockDevice,
        frames: &'static FrameAllocator,
    ) -> KernelResult<Self> {
        let mut metas: [Option<BufMeta>; NBUF] = [const { None }; NBUF];
        for (i, slot) in metas.iter_mut().enumerate() {
            let data = frames.alloc()?;
            *slot = Some(BufMeta {
                dev: 0,
                blockno: 0,
                valid: false,
                refcnt: 0,
                data,
                prev: if i == 0 { HEAD } else { i - 1 },
                next: if i == NBUF - 1 { HEAD } else { i + 1 },
            });
        }
        let meta = metas.map(|m| m.expect("all slots initialized"));
        Ok(Self {
            disk,
            ctl: SpinLock::new(
                "bcache",
                CacheCtl {
                    meta,
                    head_next: 0,
                    head_prev: NBUF - 1,
                },
            ),
            locks: [const { SleepLock::new("buffer", ()) }; NBUF],
        })
    }

    /// Find or reclaim a slot for (dev, blockno); bump its refcount.
    fn get(&self, dev: u32, blockno: u32) -> usize {
        let mut ctl = self.ctl.lock();

        // Hit? Scan from the MRU end.
        let mut i = ctl.head_next;
        while i != HEAD {
            if ctl.meta[i].dev == dev && ctl.meta[i].blockno == blockno {
                ctl.meta[i].refcnt += 1;
                return i;
            }
            i = ctl.meta[i].next;
        }

        // Miss: reclaim the least-recently-released unused buffer.
        let mut i = ctl.head_prev;
        while i != HEAD {
            if ctl.meta[i].refcnt == 0 {
                let m = &mut ctl.meta[i];
                m.dev = dev;
                m.blockno = blockno;
                m.valid = false;
                m.refcnt = 1;
                return i;
            }
            i = ctl.meta[i].prev;
        }

        panic!("buffer cache: no free buffers");
    }

    /// Return a locked buffer whose contents reflect block `blockno`.
    pub fn bread(&self, dev: u32, blockno: u32) -> KernelResult<BufGuard<'_>> {
        let idx = self.get(dev, blockno);
        let lock = self.locks[idx].lock();

        let (valid, data) = {
            let ctl = self.ctl.lock();
            (ctl.meta[idx].valid, ctl.meta[idx].data)
        };
        let mut guard = BufGuard {
            cache: self,
            idx,
            dev,
            blockno,
            data,
            _lock: lock,
        };
        if !valid {
            self.disk.read_block(blockno, guard.data_mut())?;
            self.ctl.lock().meta[idx].valid = true;
        }
        Ok(guard)
    }

    /// Write a buffer's contents through to disk.
    pub fn bwrite(&self, buf: &BufGuard<'_>) -> KernelResult<()> {
        self.disk.write_block(buf.blockno, buf.data())
    }

    /// Pin a buffer in the cache (the log holds modified blocks across
    /// the commit).
    pub(crate) fn pin(&self, idx: usize) {
        self.ctl.lock().meta[idx].refcnt += 1;
    }

    /// Drop a pin taken with [`Self::pin`].
    pub(crate) fn unpin(&self, idx: usize) {
        let mut ctl = self.ctl.lock();
        assert!(ctl.meta[idx].refcnt > 0, "buffer cache: unpin underflow");
        ctl.meta[idx].refcnt -= 1;
    }

    /// Called when a guard drops: release the reference and, once
    /// unreferenced, promote the buffer to the most-recently-used end.
    fn release(&self, idx: usize) {
        let mut ctl = self.ctl.lock();
        assert!(ctl.meta[idx].refcnt > 0, "buffer cache: refcnt underflow");
        ctl.meta[idx].refcnt -= 1;
        if ctl.meta[idx].refcnt == 0 {
            ctl.move_to_front(idx);
        }
    }
}

/// A locked reference to one cached block. Dropping it releases the
/// sleep lock and the cache reference (the `brelse` of the C world).
pub struct BufGuard<'a> {
    cache: &'a BufferCache,
    idx: usize,
    dev: u32,
    blockno: u32,
    data: PhysAddr,
    _lock: SleepLockGuard<'a, ()>,
}

impl BufGuard<'_> {
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub(crate) fn cache_index(&self) -> usize {
        self.idx
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the sleep lock is held and the data frame lives as
        // long as the cache; no aliasing access exists.
        unsafe { core::slice::from_raw_parts(self.data.as_ptr::<u8>(), BSIZE) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the guard is unique.
        unsafe { core::slice::from_raw_parts_mut(self.data.as_mut_ptr::<u8>(), BSIZE) }
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        self.cache.release(self.idx);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::blockdev::ramdisk::RamDisk;
    use crate::mm::frame::testing::arena_allocator;

    fn fresh_cache(blocks: u32) -> (&'static RamDisk, BufferCache) {
        let disk: &'static RamDisk = std::boxed::Box::leak(std::boxed::Box::new(RamDisk::new(blocks)));
        let frames = std::boxed::Box::leak(std::boxed::Box::new(arena_allocator(NBUF + 4)));
        (disk, BufferCache::new(disk, frames).expect("cache alloc"))
    }

    #[test]
    fn read_sees_prior_write_through_cache() {
        let (disk, cache) = fresh_cache(64);
        {
            let mut buf = cache.bread(1, 7).expect("bread");
            buf.data_mut()[0] = 0xAA;
            buf.data_mut()[1] = 0xBB;
            cache.bwrite(&buf).expect("bwrite");
        }
        // Cache hit path.
        {
            let buf = cache.bread(1, 7).expect("bread hit");
            assert_eq!(&buf.data()[..2], &[0xAA, 0xBB]);
        }
        // The bytes really reached the disk.
        let mut raw = [0u8; BSIZE];
        disk.read_block(7, &mut raw).expect("raw read");
        assert_eq!(&raw[..2], &[0xAA, 0xBB]);
    }

    #[test]
    fn reclaim_takes_least_recently_released() {
        let (_disk, cache) = fresh_cache(2 * NBUF as u32 + 8);

        // Touch blocks 0..NBUF in order; all buffers now used once.
        for b in 0..NBUF as u32 {
            let _ = cache.bread(1, b).expect("bread");
        }
        // Block 0 was released first, so it sits at the LRU end; reading
        // a new block must evict it, not block NBUF-1.
        let _ = cache.bread(1, 1000).expect("bread new");
        {
            let ctl = cache.ctl.lock();
            assert!(
                ctl.meta.iter().any(|m| m.blockno == 1000),
                "new block cached"
            );
            assert!(
                !ctl.meta.iter().any(|m| m.blockno == 0 && m.dev == 1 && m.valid),
                "least-recently-released buffer was reclaimed"
            );
            assert!(
                ctl.meta.iter().any(|m| m.blockno == NBUF as u32 - 1),
                "recently released buffers survive"
            );
        }
    }

    #[test]
    fn refcount_tracks_concurrent_holds() {
        let (_disk, cache) = fresh_cache(16);
        let idx;
        {
            let a = cache.bread(1, 3).expect("first hold");
            idx = a.cache_index();
            cache.pin(idx);
            assert_eq!(cache.ctl.lock().meta[idx].refcnt, 2);
        }
        // Guard dropped, pin still holds the buffer.
        assert_eq!(cache.ctl.lock().meta[idx].refcnt, 1);
        cache.unpin(idx);
        assert_eq!(cache.ctl.lock().meta[idx].refcnt, 0);
    }

    #[test]
    #[should_panic(expected = "no free buffers")]
    fn exhausting_the_pool_is_fatal() {
        let (_disk, cache) = fresh_cache(2 * NBUF as u32);
        // Pin every buffer, then ask for one more.
        let mut guards = std::vec::Vec::new();
        for b in 0..NBUF as u32 {
            guards.push(cache.bread(1, b).expect("bread"));
        }
        let _ = cache.bread(1, 999);
    }
}
