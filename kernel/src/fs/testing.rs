//! Hosted filesystem test support: an image formatter and mount
//! helpers over the RAM disk.
//!
//! The formatter lays the image out exactly as the kernel expects:
//! boot block, superblock, log region, inode region, bitmap, data; the
//! root directory (inode 1) carries `.` and `..`. Image building on the
//! real system is an external tool; this module exists so the hosted
//! test suite can mount a genuine filesystem.

use std::vec::Vec;

use crate::fs::blockdev::ramdisk::RamDisk;
use crate::fs::{
    FileSystem, InodeType, BPB, BSIZE, DINODE_SIZE, DIRENT_SIZE, DIRSIZ, FSMAGIC, IPB, ROOT_INO,
    Superblock,
};
use crate::mm::frame::testing::arena_allocator;
use crate::mm::FrameAllocator;
use crate::param::{LOGBLOCKS, NBUF, ROOTDEV};

/// Default image geometry for tests.
pub const TEST_FSSIZE: u32 = 2000;
pub const TEST_NINODES: u32 = 200;

/// Format a fresh filesystem image.
pub fn mkfs(size: u32, ninodes: u32) -> Vec<u8> {
    let nlog = LOGBLOCKS as u32 + 1;
    let ninodeblocks = ninodes.div_ceil(IPB as u32);
    let nbitmap = size.div_ceil(BPB as u32);
    let logstart = 2;
    let inodestart = logstart + nlog;
    let bmapstart = inodestart + ninodeblocks;
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(nmeta < size, "mkfs: image too small for metadata");

    let sb = Superblock {
        magic: FSMAGIC,
        size,
        nblocks: size - nmeta,
        ninodes,
        nlog,
        logstart,
        inodestart,
        bmapstart,
    };

    let mut image = std::vec![0u8; size as usize * BSIZE];

    // Superblock lives in block 1.
    sb.encode(&mut image[BSIZE..2 * BSIZE]);

    // Root directory: inode 1, type DIR, one data block with `.`/`..`.
    let root_data = nmeta;
    {
        let off = sb.inode_block(ROOT_INO) as usize * BSIZE
            + (ROOT_INO as usize % IPB) * DINODE_SIZE;
        let ino = &mut image[off..off + DINODE_SIZE];
        ino[..2].copy_from_slice(&(InodeType::Dir as i16).to_le_bytes());
        ino[6..8].copy_from_slice(&1i16.to_le_bytes()); // nlink
        ino[8..12].copy_from_slice(&(2 * DIRENT_SIZE as u32).to_le_bytes()); // size
        ino[12..16].copy_from_slice(&root_data.to_le_bytes()); // addrs[0]
    }
    {
        let base = root_data as usize * BSIZE;
        for (slot, name) in [(0, &b"."[..]), (1, &b".."[..])] {
            let off = base + slot * DIRENT_SIZE;
            image[off..off + 2].copy_from_slice(&(ROOT_INO as u16).to_le_bytes());
            let mut padded = [0u8; DIRSIZ];
            padded[..name.len()].copy_from_slice(name);
            image[off + 2..off + DIRENT_SIZE].copy_from_slice(&padded);
        }
    }

    // Bitmap: metadata blocks plus the root data block are in use.
    let used = nmeta + 1;
    for b in 0..used {
        let byte = bmapstart as usize * BSIZE + (b as usize / 8);
        image[byte] |= 1 << (b % 8);
    }

    image
}

/// Leaked allocation helpers: the buffer cache and block device demand
/// 'static lifetimes, and the kernel they model never unmounts.
fn leak<T>(value: T) -> &'static T {
    std::boxed::Box::leak(std::boxed::Box::new(value))
}

/// A mounted test filesystem plus the handles tests need to poke it.
pub struct TestFs {
    pub fs: FileSystem,
    pub disk: &'static RamDisk,
    pub frames: &'static FrameAllocator,
}

/// Format and mount a fresh filesystem.
pub fn fresh_fs() -> TestFs {
    mount_image(mkfs(TEST_FSSIZE, TEST_NINODES))
}

/// Mount an existing image (e.g. a crash snapshot).
pub fn mount_image(image: Vec<u8>) -> TestFs {
    let disk = leak(RamDisk::from_image(image));
    let frames = leak(arena_allocator(NBUF + 8));
    let fs = FileSystem::mount(ROOTDEV, disk, frames).expect("test fs mount");
    TestFs { fs, disk, frames }
}

impl TestFs {
    /// Simulate power loss: snapshot the disk and mount the snapshot as
    /// a new filesystem instance with a cold cache.
    pub fn remount(&self) -> TestFs {
        mount_image(self.disk.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FsError, KernelError};
    use crate::fs::inode::InodeRef;

    #[test]
    fn fresh_image_mounts_with_valid_superblock() {
        let t = fresh_fs();
        let sb = t.fs.superblock();
        assert_eq!(sb.magic, FSMAGIC);
        assert_eq!(sb.size, TEST_FSSIZE);
        assert_eq!(sb.ninodes, TEST_NINODES);
        assert!(sb.nblocks < sb.size);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut image = mkfs(TEST_FSSIZE, TEST_NINODES);
        image[BSIZE] ^= 0xff;
        let disk = leak(RamDisk::from_image(image));
        let frames = leak(arena_allocator(NBUF + 8));
        let err = FileSystem::mount(ROOTDEV, disk, frames).unwrap_err();
        assert_eq!(err, KernelError::Fs(FsError::BadMagic));
    }

    #[test]
    fn root_directory_lists_dot_entries() {
        let t = fresh_fs();
        let root = t.fs.iget(ROOTDEV, ROOT_INO).expect("root iget");
        let mut guard = t.fs.ilock(root).expect("root ilock");
        assert_eq!(guard.typ, InodeType::Dir);

        let (dot, _) = t
            .fs
            .dirlookup(&mut guard, b".")
            .expect("lookup")
            .expect("'.' exists");
        assert_eq!(dot.inum, ROOT_INO);
        let (dotdot, _) = t
            .fs
            .dirlookup(&mut guard, b"..")
            .expect("lookup")
            .expect("'..' exists");
        assert_eq!(dotdot.inum, ROOT_INO);
        drop(guard);
        t.fs.iput(dot);
        t.fs.iput(dotdot);
        t.fs.iput(root);
    }

    #[test]
    fn balloc_hands_out_data_blocks_and_bfree_recycles() {
        let t = fresh_fs();
        t.fs.log.begin_op(&t.fs);
        let a = t.fs.balloc().expect("balloc");
        let b = t.fs.balloc().expect("balloc");
        assert!(a >= t.fs.data_start(), "allocations come from the data area");
        assert_ne!(a, b);
        t.fs.bfree(a).expect("bfree");
        let c = t.fs.balloc().expect("realloc");
        assert_eq!(a, c, "first-fit bitmap scan reuses the freed block");
        t.fs.log.end_op(&t.fs).expect("commit");
    }

    #[test]
    fn iget_shares_slots_by_identity() {
        let t = fresh_fs();
        let a = t.fs.iget(ROOTDEV, ROOT_INO).expect("iget");
        let b = t.fs.iget(ROOTDEV, ROOT_INO).expect("iget again");
        assert_eq!(a.idx, b.idx, "same inode, same cache slot");
        let c = t.fs.iget(ROOTDEV, 2).expect("different inode");
        assert_ne!(a.idx, c.idx);
        t.fs.iput(a);
        t.fs.iput(b);
        t.fs.iput(c);
    }

    #[test]
    fn sysinfo_counts_shrink_as_storage_is_used() {
        let t = fresh_fs();
        let before = t.fs.sysinfo().expect("sysinfo");
        assert_eq!(before.total_inodes, TEST_NINODES as u64);
        assert!(before.free_blocks > 0);

        t.fs.log.begin_op(&t.fs);
        let ip: InodeRef = t
            .fs
            .create(b"/used", InodeType::File, 0, 0, None)
            .expect("create");
        let mut g = t.fs.ilock(ip).expect("ilock");
        let payload = [0xA5u8; BSIZE];
        g.write(false, payload.as_ptr() as usize, 0, BSIZE)
            .expect("write");
        drop(g);
        t.fs.iput(ip);
        t.fs.log.end_op(&t.fs).expect("commit");

        let after = t.fs.sysinfo().expect("sysinfo");
        assert_eq!(after.free_inodes + 1, before.free_inodes);
        assert!(after.free_blocks < before.free_blocks);
    }
}
