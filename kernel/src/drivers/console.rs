//! Console device: line-buffered input, formatted output.
//!
//! Input arrives one byte at a time from the UART receive interrupt and
//! accumulates in a circular buffer with three cursors: `r` (next byte a
//! reader takes), `w` (committed line end), and `e` (edit position).
//! Backspace rewinds `e` while it is still past `w`; newline, Ctrl-D, or
//! a full buffer commits the edited line by advancing `w` to `e` and
//! waking readers.
//!
//! Output is transparent passthrough to the UART, so ANSI escape
//! sequences (colors, clear-screen) reach the terminal uninterpreted.

use core::fmt;
use core::sync::atomic::AtomicBool;

use crate::drivers::uart;
use crate::error::{KernelError, KernelResult};
use crate::param::INPUT_BUF;
use crate::proc;
use crate::sync::spinlock::SpinLock;

/// Major device number of the console.
pub const CONSOLE_MAJOR: u16 = 1;

const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

struct LineBuffer {
    buf: [u8; INPUT_BUF],
    /// Read cursor: next byte handed to a reader.
    r: usize,
    /// Write-commit cursor: end of the last committed line.
    w: usize,
    /// Edit cursor: end of the line still being edited.
    e: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

static CONSOLE: SpinLock<LineBuffer> = SpinLock::new("console", LineBuffer::new());

/// Sleep channel for blocked readers.
fn read_chan() -> usize {
    &CONSOLE as *const _ as usize
}

/// Set once the kernel panics; output then bypasses the print lock so a
/// panic inside a print cannot deadlock.
pub static PANICKED: AtomicBool = AtomicBool::new(false);

/// One received byte from the UART interrupt handler.
pub fn handle_input(c: u8) {
    let mut cons = CONSOLE.lock();
    match c {
        BACKSPACE | DELETE => {
            // Rewind only within the uncommitted tail of the line.
            if cons.e != cons.w {
                cons.e -= 1;
                echo(BACKSPACE);
                echo(b' ');
                echo(BACKSPACE);
            }
        }
        _ => {
            if c != 0 && cons.e - cons.r < INPUT_BUF {
                let c = if c == b'\r' { b'\n' } else { c };
                echo(c);
                let idx = cons.e % INPUT_BUF;
                cons.buf[idx] = c;
                cons.e += 1;
                if c == b'\n' || c == CTRL_D || cons.e - cons.r == INPUT_BUF {
                    cons.w = cons.e;
                    proc::wakeup(read_chan());
                }
            }
        }
    }
}

fn echo(c: u8) {
    uart::putc_sync(c);
}

/// Console read for the device switch table: block until a committed
/// line exists, then copy bytes out one at a time, stopping at newline
/// or end-of-file.
pub fn read(user_dst: bool, mut dst: usize, n: usize) -> KernelResult<usize> {
    let mut cons = CONSOLE.lock();
    let mut got = 0;
    while got < n {
        while cons.r == cons.w {
            if proc::current_killed() {
                return Err(KernelError::Interrupted);
            }
            cons = proc::sleep(read_chan(), cons);
        }
        let idx = cons.r % INPUT_BUF;
        let c = cons.buf[idx];
        cons.r += 1;

        if c == CTRL_D {
            if got > 0 {
                // Leave the EOF byte for the next read so a partial line
                // is delivered first.
                cons.r -= 1;
            }
            break;
        }

        proc::either_copy_out(user_dst, dst, &[c])?;
        dst += 1;
        got += 1;

        if c == b'\n' {
            break;
        }
    }
    Ok(got)
}

/// Console write for the device switch table: copy bytes in one at a
/// time and push them straight to the UART.
pub fn write(user_src: bool, src: usize, n: usize) -> KernelResult<usize> {
    for i in 0..n {
        let mut c = [0u8; 1];
        proc::either_copy_in(user_src, &mut c, src + i)?;
        uart::putc_sync(c[0]);
    }
    Ok(n)
}

/// Initialize the UART and hook the console into the device switch.
pub fn init() {
    uart::init();
    crate::fs::file::register_device(CONSOLE_MAJOR, read, write);
}

// ---------------------------------------------------------------------
// Kernel-side formatted output
// ---------------------------------------------------------------------

#[cfg(target_os = "none")]
struct ConsoleWriter;

#[cfg(target_os = "none")]
impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            uart::putc_sync(b);
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
static PRINT_LOCK: SpinLock<()> = SpinLock::new("print", ());

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(not(target_os = "none"))]
    {
        std::print!("{}", args);
    }

    #[cfg(target_os = "none")]
    {
        use core::fmt::Write;
        use core::sync::atomic::Ordering;

        if PANICKED.load(Ordering::Relaxed) {
            // The panicking path owns the console; locking could hang.
            let _ = ConsoleWriter.write_fmt(args);
        } else {
            let _guard = PRINT_LOCK.lock();
            let _ = ConsoleWriter.write_fmt(args);
        }
    }
}

/// Standard ANSI clear-screen plus cursor-home.
pub fn clear_screen() {
    crate::print!("\x1b[2J\x1b[H");
}

/// Select Graphic Rendition: switch the foreground color.
pub fn set_color(sgr: u8) {
    crate::print!("\x1b[{}m", sgr);
}

/// Reset colors and attributes.
pub fn reset_color() {
    crate::print!("\x1b[0m");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// The console is a process-wide singleton; serialize tests touching
    /// it so the harness's parallel threads don't interleave input.
    static TEST_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn drain() {
        // Tests share the one console; swallow anything a previous test
        // committed.
        let mut cons = CONSOLE.lock();
        let w = cons.w;
        cons.r = w;
        let e = cons.e;
        cons.w = e;
        cons.r = cons.w;
    }

    fn read_into(buf: &mut [u8]) -> usize {
        read(false, buf.as_mut_ptr() as usize, buf.len()).expect("console read")
    }

    #[test]
    fn committed_line_is_readable() {
        let _serial = TEST_GUARD.lock().unwrap();
        drain();
        for &b in b"hi\n" {
            handle_input(b);
        }
        let mut buf = [0u8; 16];
        let n = read_into(&mut buf);
        assert_eq!(&buf[..n], b"hi\n");
        drain();
    }

    #[test]
    fn backspace_edits_uncommitted_tail() {
        let _serial = TEST_GUARD.lock().unwrap();
        drain();
        for &b in b"adc" {
            handle_input(b);
        }
        handle_input(BACKSPACE);
        handle_input(BACKSPACE);
        for &b in b"bc\n" {
            handle_input(b);
        }
        let mut buf = [0u8; 16];
        let n = read_into(&mut buf);
        assert_eq!(&buf[..n], b"abc\n");
        drain();
    }

    #[test]
    fn backspace_on_empty_edit_buffer_is_noop() {
        let _serial = TEST_GUARD.lock().unwrap();
        drain();
        let (r, w, e) = {
            let cons = CONSOLE.lock();
            (cons.r, cons.w, cons.e)
        };
        handle_input(BACKSPACE);
        let cons = CONSOLE.lock();
        assert_eq!((cons.r, cons.w, cons.e), (r, w, e));
    }

    #[test]
    fn carriage_return_becomes_newline() {
        let _serial = TEST_GUARD.lock().unwrap();
        drain();
        handle_input(b'x');
        handle_input(b'\r');
        let mut buf = [0u8; 4];
        let n = read_into(&mut buf);
        assert_eq!(&buf[..n], b"x\n");
        drain();
    }

    #[test]
    fn eof_terminates_read_without_consuming_partial_line() {
        let _serial = TEST_GUARD.lock().unwrap();
        drain();
        for &b in b"ab" {
            handle_input(b);
        }
        handle_input(CTRL_D);
        let mut buf = [0u8; 8];
        let n = read_into(&mut buf);
        assert_eq!(&buf[..n], b"ab");
        // Next read sees the EOF byte alone: zero bytes.
        let n = read_into(&mut buf);
        assert_eq!(n, 0);
        drain();
    }
}
