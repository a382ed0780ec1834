//! Pipes: a fixed-capacity circular byte stream between two open files.
//!
//! The cursors are free-running byte counters reduced modulo the
//! capacity on access, so `nwrite - nread` is always the number of
//! buffered bytes. Readers sleep on the read cursor's identity, writers
//! on the write cursor's; closing either end wakes the other side so it
//! can observe EOF or a broken pipe.

use crate::error::{KernelError, KernelResult};
use crate::param::PIPESIZE;
use crate::proc;
use crate::sync::spinlock::SpinLock;

struct PipeInner {
    data: [u8; PIPESIZE],
    /// Total bytes ever read.
    nread: u32,
    /// Total bytes ever written.
    nwrite: u32,
    readopen: bool,
    writeopen: bool,
}

/// A pipe. Lives in a single frame allocated at `pipe()` time and freed
/// when both ends close.
pub struct Pipe {
    inner: SpinLock<PipeInner>,
}

impl Pipe {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
        }
    }

    /// Sleep channel for blocked readers.
    fn read_chan(&self) -> usize {
        self as *const _ as usize
    }

    /// Sleep channel for blocked writers.
    fn write_chan(&self) -> usize {
        self as *const _ as usize + 1
    }

    /// Write `n` bytes from `src`, sleeping whenever the buffer fills.
    ///
    /// Fails with `BrokenPipe` once the read end is closed; a bad user
    /// address ends the write early with the count so far.
    pub fn write(&self, user_src: bool, src: usize, n: usize) -> KernelResult<usize> {
        let mut pi = self.inner.lock();
        let mut written = 0;
        while written < n {
            if !pi.readopen {
                drop(pi);
                proc::wakeup(self.read_chan());
                return Err(KernelError::BrokenPipe);
            }
            if proc::current_killed() {
                return Err(KernelError::Interrupted);
            }
            if pi.nwrite == pi.nread + PIPESIZE as u32 {
                proc::wakeup(self.read_chan());
                pi = proc::sleep(self.write_chan(), pi);
            } else {
                let mut byte = [0u8; 1];
                if proc::either_copy_in(user_src, &mut byte, src + written).is_err() {
                    break;
                }
                let slot = pi.nwrite as usize % PIPESIZE;
                pi.data[slot] = byte[0];
                pi.nwrite += 1;
                written += 1;
            }
        }
        drop(pi);
        proc::wakeup(self.read_chan());
        Ok(written)
    }

    /// Read up to `n` bytes into `dst`. Blocks while the pipe is empty
    /// and the write end is open; returns 0 at EOF.
    pub fn read(&self, user_dst: bool, dst: usize, n: usize) -> KernelResult<usize> {
        let mut pi = self.inner.lock();
        while pi.nread == pi.nwrite && pi.writeopen {
            if proc::current_killed() {
                return Err(KernelError::Interrupted);
            }
            pi = proc::sleep(self.read_chan(), pi);
        }
        let mut got = 0;
        while got < n {
            if pi.nread == pi.nwrite {
                break;
            }
            let slot = pi.nread as usize % PIPESIZE;
            let byte = [pi.data[slot]];
            pi.nread += 1;
            if proc::either_copy_out(user_dst, dst + got, &byte).is_err() {
                break;
            }
            got += 1;
        }
        drop(pi);
        proc::wakeup(self.write_chan());
        Ok(got)
    }

    /// Close one end. Returns true when both ends are now closed and the
    /// pipe's storage can be reclaimed.
    pub fn close(&self, writable_end: bool) -> bool {
        let mut pi = self.inner.lock();
        if writable_end {
            pi.writeopen = false;
        } else {
            pi.readopen = false;
        }
        let both_closed = !pi.readopen && !pi.writeopen;
        drop(pi);
        if writable_end {
            // Readers must wake to see EOF.
            proc::wakeup(self.read_chan());
        } else {
            // Writers must wake to see the broken pipe.
            proc::wakeup(self.write_chan());
        }
        both_closed
    }

    /// Buffered byte count (diagnostic).
    pub fn len(&self) -> usize {
        let pi = self.inner.lock();
        (pi.nwrite - pi.nread) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn kbuf(buf: &mut [u8]) -> usize {
        buf.as_mut_ptr() as usize
    }

    #[test]
    fn bytes_flow_in_order() {
        let p = Pipe::new();
        let msg = b"Hello World\0";
        let n = p.write(false, msg.as_ptr() as usize, msg.len()).expect("write");
        assert_eq!(n, 12);

        let mut buf = [0u8; 100];
        let n = p.read(false, kbuf(&mut buf), 100).expect("read");
        assert_eq!(n, 12);
        assert_eq!(&buf[..n], msg);
    }

    #[test]
    fn cursor_invariant_holds_across_wraparound() {
        let p = Pipe::new();
        let chunk = [7u8; 100];
        let mut sink = [0u8; 100];
        // Push the cursors well past one lap of the ring.
        for _ in 0..20 {
            p.write(false, chunk.as_ptr() as usize, 100).expect("write");
            let pi = p.inner.lock();
            assert!(pi.nread <= pi.nwrite);
            assert!(pi.nwrite <= pi.nread + PIPESIZE as u32);
            drop(pi);
            let n = p.read(false, kbuf(&mut sink), 100).expect("read");
            assert_eq!(n, 100);
            assert_eq!(sink[99], 7);
        }
        assert!(p.is_empty());
    }

    #[test]
    fn read_returns_zero_at_eof() {
        let p = Pipe::new();
        p.write(false, b"x".as_ptr() as usize, 1).expect("write");
        assert!(!p.close(true), "read end still open");

        let mut buf = [0u8; 4];
        assert_eq!(p.read(false, kbuf(&mut buf), 4).expect("drain"), 1);
        assert_eq!(p.read(false, kbuf(&mut buf), 4).expect("eof"), 0);
    }

    #[test]
    fn write_after_reader_closes_is_broken_pipe() {
        let p = Pipe::new();
        assert!(!p.close(false), "write end still open");
        let err = p.write(false, b"x".as_ptr() as usize, 1).unwrap_err();
        assert_eq!(err, KernelError::BrokenPipe);
    }

    #[test]
    fn both_ends_closed_reports_reclaimable() {
        let p = Pipe::new();
        assert!(!p.close(true));
        assert!(p.close(false), "second close reclaims the pipe");
    }
}
