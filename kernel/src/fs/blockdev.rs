//! Block device abstraction.
//!
//! The buffer cache talks to storage through this trait. On hardware the
//! one implementation is the virtio-blk driver; hosted tests substitute a
//! RAM-backed device so the whole filesystem stack runs under the
//! standard test harness.

use crate::error::KernelResult;

/// A device addressable in filesystem blocks of [`crate::fs::BSIZE`]
/// bytes.
///
/// Implementations block the calling process until the transfer is
/// complete (sleeping, or busy-polling during early boot).
pub trait BlockDevice: Sync {
    /// Read block `blockno` into `buf` (exactly `BSIZE` bytes).
    fn read_block(&self, blockno: u32, buf: &mut [u8]) -> KernelResult<()>;

    /// Write `buf` (exactly `BSIZE` bytes) to block `blockno`.
    fn write_block(&self, blockno: u32, buf: &[u8]) -> KernelResult<()>;

    /// Number of blocks on the device.
    fn block_count(&self) -> u32;
}

#[cfg(not(target_os = "none"))]
pub mod ramdisk {
    //! RAM-backed block device for hosted tests.

    use super::BlockDevice;
    use crate::error::{KernelError, KernelResult};
    use crate::fs::BSIZE;

    use std::sync::Mutex;
    use std::vec::Vec;

    /// An in-memory disk image.
    ///
    /// Reads and writes complete synchronously, which also means the
    /// buffer cache's lazy-read and sleep paths are exercised without a
    /// scheduler.
    pub struct RamDisk {
        blocks: Mutex<Vec<u8>>,
        count: u32,
    }

    impl RamDisk {
        pub fn new(block_count: u32) -> Self {
            Self {
                blocks: Mutex::new(std::vec![0u8; block_count as usize * BSIZE]),
                count: block_count,
            }
        }

        /// Build a disk from a pre-formatted image.
        pub fn from_image(image: Vec<u8>) -> Self {
            assert_eq!(image.len() % BSIZE, 0, "image must be whole blocks");
            let count = (image.len() / BSIZE) as u32;
            Self {
                blocks: Mutex::new(image),
                count,
            }
        }

        /// Snapshot the raw image (for simulating power loss: clone the
        /// bytes, drop the filesystem, remount from the clone).
        pub fn snapshot(&self) -> Vec<u8> {
            self.blocks.lock().unwrap().clone()
        }

        fn range(&self, blockno: u32, len: usize) -> KernelResult<core::ops::Range<usize>> {
            if blockno >= self.count || len != BSIZE {
                return Err(KernelError::DeviceError {
                    device: "ramdisk",
                    code: blockno,
                });
            }
            let start = blockno as usize * BSIZE;
            Ok(start..start + BSIZE)
        }
    }

    impl BlockDevice for RamDisk {
        fn read_block(&self, blockno: u32, buf: &mut [u8]) -> KernelResult<()> {
            let range = self.range(blockno, buf.len())?;
            buf.copy_from_slice(&self.blocks.lock().unwrap()[range]);
            Ok(())
        }

        fn write_block(&self, blockno: u32, buf: &[u8]) -> KernelResult<()> {
            let range = self.range(blockno, buf.len())?;
            self.blocks.lock().unwrap()[range].copy_from_slice(buf);
            Ok(())
        }

        fn block_count(&self) -> u32 {
            self.count
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn read_back_what_was_written() {
            let disk = RamDisk::new(4);
            let mut block = [0u8; BSIZE];
            block[0] = 0x42;
            block[BSIZE - 1] = 0x24;
            disk.write_block(2, &block).expect("write");

            let mut back = [0u8; BSIZE];
            disk.read_block(2, &mut back).expect("read");
            assert_eq!(back[0], 0x42);
            assert_eq!(back[BSIZE - 1], 0x24);
        }

        #[test]
        fn out_of_range_block_is_an_error() {
            let disk = RamDisk::new(4);
            let mut buf = [0u8; BSIZE];
            assert!(disk.read_block(4, &mut buf).is_err());
        }
    }
}
