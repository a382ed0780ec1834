//! Timer ticks and the sleep syscall's time base.
//!
//! The supervisor timer (sstc extension, `stimecmp`) fires roughly ten
//! times a second; each tick advances a global counter and wakes
//! everything sleeping on it. Sleepers measure elapsed ticks, so a
//! wakeup for someone else's deadline is just a spurious pass through
//! the loop.

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::proc;
use crate::sync::spinlock::SpinLock;

/// Timer interval in time-counter units (the QEMU virt clock runs at
/// 10 MHz, so this is a tenth of a second).
const TICK_INTERVAL: u64 = 1_000_000;

static TICKS: SpinLock<u64> = SpinLock::new("time", 0);

/// Sleep channel for tick waiters.
fn tick_chan() -> usize {
    &TICKS as *const _ as usize
}

/// Arm the first timer deadline on this hart.
pub fn init_hart() {
    arch::write_stimecmp(arch::read_time() + TICK_INTERVAL);
    log::info!("timer: interval {} cycles", TICK_INTERVAL);
}

/// Timer interrupt: schedule the next deadline, advance the tick
/// counter, wake sleepers.
pub fn tick() {
    arch::write_stimecmp(arch::read_time() + TICK_INTERVAL);
    {
        let mut ticks = TICKS.lock();
        *ticks += 1;
    }
    proc::wakeup(tick_chan());
}

/// Current tick count (uptime syscall).
pub fn ticks() -> u64 {
    *TICKS.lock()
}

/// Block the calling process for `n` ticks.
pub fn sleep_ticks(n: u64) -> KernelResult<()> {
    let mut ticks = TICKS.lock();
    let start = *ticks;
    while *ticks - start < n {
        if proc::current_killed() {
            return Err(KernelError::Interrupted);
        }
        ticks = proc::sleep(tick_chan(), ticks);
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_and_zero_sleep_returns() {
        let before = ticks();
        tick();
        tick();
        assert!(ticks() >= before + 2);
        sleep_ticks(0).expect("sleeping for zero ticks returns at once");
    }
}
