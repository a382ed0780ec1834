//! Write-ahead log: one system-wide transaction at a time.
//!
//! Callers bracket every filesystem operation with [`Log::begin_op`] /
//! [`Log::end_op`] and route modified buffers through [`Log::write`]
//! instead of writing them home directly. Commit order is what makes a
//! crash recoverable:
//!
//! 1. copy each enrolled buffer into its slot in the log region,
//! 2. write the log header naming the home blocks (the commit point),
//! 3. install: copy each log slot to its home block,
//! 4. write a zeroed header.
//!
//! A crash before step 2 loses the operation cleanly (header count is
//! still zero); a crash after step 2 is completed by recovery at the
//! next mount, which re-runs the install from the log region.
//!
//! The crash-point switch emulates a power failure at either side of
//! the commit point; the `fslog_crash` syscall arms it for the log
//! recovery tests.

use crate::error::KernelResult;
use crate::fs::{FileSystem, BSIZE};
use crate::fs::buffer::BufGuard;
use crate::param::LOGBLOCKS;
use crate::sync::sleeplock::RawSleepLock;
use crate::sync::spinlock::SpinLock;

/// Where a simulated power failure strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// No fault injection.
    None,
    /// Die after writing half the log data blocks, before the header.
    DuringLogWrite,
    /// Die right after the header commit, before the install.
    AfterCommit,
}

impl CrashPoint {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            1 => Self::DuringLogWrite,
            2 => Self::AfterCommit,
            _ => Self::None,
        }
    }
}

struct LogState {
    /// Home block numbers staged in the current transaction.
    blocks: [u32; LOGBLOCKS],
    n: u32,
    crash: CrashPoint,
}

/// The write-ahead log.
pub struct Log {
    /// Serializes transactions: held from begin_op to end_op.
    op_lock: RawSleepLock,
    state: SpinLock<LogState>,
    /// Block number of the on-disk log header.
    start: u32,
    /// Data slots available in the log region.
    capacity: u32,
}

impl Log {
    pub fn new(start: u32, capacity: u32) -> Self {
        Self {
            op_lock: RawSleepLock::new("log"),
            state: SpinLock::new(
                "logstate",
                LogState {
                    blocks: [0; LOGBLOCKS],
                    n: 0,
                    crash: CrashPoint::None,
                },
            ),
            start,
            capacity: capacity.min(LOGBLOCKS as u32),
        }
    }

    /// Arm (or disarm) the simulated power failure.
    pub fn set_crash_point(&self, point: CrashPoint) {
        self.state.lock().crash = point;
    }

    /// Begin a filesystem operation. Blocks while another operation owns
    /// the log.
    pub fn begin_op(&self, _fs: &FileSystem) {
        self.op_lock.acquire();
        debug_assert_eq!(self.state.lock().n, 0, "log: stale transaction");
    }

    /// Enroll a modified buffer in the current transaction and pin it in
    /// the cache until the commit copies it out.
    ///
    /// Overflowing the log region is a fatal bug in the caller: no
    /// operation may dirty more than the region holds.
    pub fn write(&self, fs: &FileSystem, buf: &BufGuard<'_>) {
        let mut st = self.state.lock();
        if st.n >= self.capacity {
            panic!("log: transaction too big");
        }
        // Absorption: a block already enrolled stays enrolled; the
        // commit reads the latest cache contents anyway.
        let n = st.n as usize;
        for i in 0..n {
            if st.blocks[i] == buf.blockno() {
                return;
            }
        }
        st.blocks[n] = buf.blockno();
        st.n += 1;
        drop(st);
        fs.cache.pin(buf.cache_index());
    }

    /// End the operation: commit if anything was staged, then hand the
    /// log to the next waiter.
    pub fn end_op(&self, fs: &FileSystem) -> KernelResult<()> {
        let result = self.commit(fs);
        self.op_lock.release();
        result
    }

    fn commit(&self, fs: &FileSystem) -> KernelResult<()> {
        let (n, blocks, crash) = {
            let st = self.state.lock();
            (st.n, st.blocks, st.crash)
        };
        if n == 0 {
            return Ok(());
        }

        if crash == CrashPoint::DuringLogWrite {
            for i in 0..n / 2 {
                self.copy_to_log(fs, i, blocks[i as usize])?;
            }
            return self.power_failure("power failure during log write");
        }

        // 1. Stage every enrolled block's cache contents in the log
        //    region.
        for i in 0..n {
            self.copy_to_log(fs, i, blocks[i as usize])?;
        }

        // 2. Commit point: the header write makes the transaction
        //    durable in one block update.
        self.write_header(fs, n, &blocks)?;

        if crash == CrashPoint::AfterCommit {
            return self.power_failure("power failure after commit");
        }

        // 3. Install the staged blocks in their home locations.
        self.install(fs, n, &blocks, false)?;

        // 4. Clear the header: the transaction is fully applied.
        {
            let mut st = self.state.lock();
            st.n = 0;
        }
        self.write_header(fs, 0, &[0; LOGBLOCKS])?;
        Ok(())
    }

    /// Copy staged slot `i` (home block `home`) from the cache into the
    /// log region. The pin taken by [`Self::write`] stays until install.
    fn copy_to_log(&self, fs: &FileSystem, i: u32, home: u32) -> KernelResult<()> {
        let cached = fs.cache.bread(fs.dev, home)?;
        let mut log_buf = fs.cache.bread(fs.dev, self.start + 1 + i)?;
        log_buf.data_mut().copy_from_slice(cached.data());
        fs.cache.bwrite(&log_buf)?;
        Ok(())
    }

    /// Write the on-disk log header with `n` staged home blocks.
    fn write_header(&self, fs: &FileSystem, n: u32, blocks: &[u32; LOGBLOCKS]) -> KernelResult<()> {
        let mut buf = fs.cache.bread(fs.dev, self.start)?;
        let data = buf.data_mut();
        data[..4].copy_from_slice(&n.to_le_bytes());
        for (i, b) in blocks.iter().enumerate() {
            data[4 + i * 4..8 + i * 4].copy_from_slice(&b.to_le_bytes());
        }
        fs.cache.bwrite(&buf)?;
        Ok(())
    }

    /// Copy log slots into their home blocks. During normal commit the
    /// pins from [`Self::write`] are dropped here; recovery never took
    /// pins.
    fn install(
        &self,
        fs: &FileSystem,
        n: u32,
        blocks: &[u32; LOGBLOCKS],
        recovering: bool,
    ) -> KernelResult<()> {
        for i in 0..n {
            let home = blocks[i as usize];
            let log_buf = fs.cache.bread(fs.dev, self.start + 1 + i)?;
            let mut home_buf = fs.cache.bread(fs.dev, home)?;
            home_buf
                .data_mut()
                .copy_from_slice(&log_buf.data()[..BSIZE]);
            fs.cache.bwrite(&home_buf)?;
            if !recovering {
                fs.cache.unpin(home_buf.cache_index());
            }
        }
        Ok(())
    }

    /// Mount-time recovery: a non-zero header count means a committed
    /// transaction never finished installing; re-run the install (at
    /// most once) and clear the header.
    pub fn recover(&self, fs: &FileSystem) -> KernelResult<()> {
        let (n, blocks) = {
            let buf = fs.cache.bread(fs.dev, self.start)?;
            let data = buf.data();
            let n = u32::from_le_bytes(data[..4].try_into().unwrap());
            let mut blocks = [0u32; LOGBLOCKS];
            for (i, b) in blocks.iter_mut().enumerate() {
                *b = u32::from_le_bytes(data[4 + i * 4..8 + i * 4].try_into().unwrap());
            }
            (n, blocks)
        };

        if n > 0 {
            log::info!("fs: log recovery replaying {} blocks", n);
            self.install(fs, n.min(self.capacity), &blocks, true)?;
            self.write_header(fs, 0, &[0; LOGBLOCKS])?;
        }
        Ok(())
    }

    /// A simulated power failure: fatal on hardware, an observable error
    /// under test. The staged transaction state is deliberately left as
    /// the crash found it.
    fn power_failure(&self, point: &'static str) -> KernelResult<()> {
        #[cfg(target_os = "none")]
        panic!("log crash test: {}", point);

        #[cfg(not(target_os = "none"))]
        Err(crate::error::KernelError::SimulatedCrash { point })
    }
}
