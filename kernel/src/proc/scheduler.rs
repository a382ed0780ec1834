//! The scheduler and the sleep/wakeup discipline.
//!
//! Cooperative kernel-mode multitasking over one primitive: `swtch`
//! saves the callee-saved registers into one [`Context`] and restores
//! another, nothing else. The scheduler loop and every parked process
//! are simply contexts waiting for their turn.
//!
//! Wakeups carry no hand-off: every sleeper re-checks its condition
//! after waking, and spurious wakeups are expected.

use crate::arch;
use crate::proc::{cpu_mut, table_mut, Context, ProcState};
use crate::sync::spinlock::{
    intr_depth, intr_depth_restore, intr_depth_save, pop_off, push_off, SpinLockGuard,
};

#[cfg(target_os = "none")]
extern "C" {
    /// Register-for-register context switch (swtch.S).
    fn swtch(old: *mut Context, new: *const Context);
}

/// Hosted stub: nothing to switch to.
#[cfg(not(target_os = "none"))]
unsafe fn swtch(_old: *mut Context, _new: *const Context) {
    unreachable!("swtch has no meaning on hosted targets");
}

/// The per-hart scheduler loop. Never returns.
///
/// Interrupts are briefly enabled at the top of each pass so pending
/// device and timer interrupts land; the scan and switch then run with
/// them off.
pub fn scheduler() -> ! {
    loop {
        arch::intr_on();
        arch::intr_off();

        let mut ran = false;
        for i in 0..crate::param::NPROC {
            push_off();
            // SAFETY: interrupts are off on this hart.
            let table = unsafe { table_mut() };
            if table.procs[i].state == ProcState::Runnable {
                table.procs[i].state = ProcState::Running;
                // SAFETY: as above.
                let cpu = unsafe { cpu_mut() };
                cpu.current = Some(i);

                let saved = intr_depth_save();
                // SAFETY: both contexts are live: the CPU context is in
                // this static, the process context was prepared by
                // alloc() or a previous sched(). Interrupts are off for
                // the whole switch.
                unsafe {
                    swtch(&mut cpu.context, &table.procs[i].context);
                }
                intr_depth_restore(saved);

                // SAFETY: interrupts are off again after the switch back.
                unsafe { cpu_mut() }.current = None;
                ran = true;
            }
            pop_off();
        }

        if !ran {
            // Nothing runnable: park until an interrupt arrives.
            arch::wait_for_interrupt();
        }
    }
}

/// Switch from the current process back to the scheduler.
///
/// Caller must have interrupts off with exactly one push_off level (its
/// own critical section) and must already have moved the process out of
/// the Running state.
pub(crate) fn sched() {
    assert!(!arch::intr_get(), "sched: interruptible");
    assert_eq!(intr_depth(), 1, "sched: holding locks");
    // SAFETY: interrupts are off.
    let cpu = unsafe { cpu_mut() };
    let idx = cpu.current.expect("sched: no process");
    // SAFETY: as above.
    let table = unsafe { table_mut() };
    assert!(
        table.procs[idx].state != ProcState::Running,
        "sched: still running"
    );

    let saved = intr_depth_save();
    // SAFETY: both contexts are live; see scheduler().
    unsafe {
        swtch(&mut table.procs[idx].context, &cpu.context);
    }
    intr_depth_restore(saved);
}

/// Give up the CPU for one scheduling round.
pub fn yield_cpu() {
    push_off();
    // SAFETY: interrupts are off.
    let cpu = unsafe { cpu_mut() };
    if let Some(idx) = cpu.current {
        // SAFETY: as above.
        unsafe { table_mut() }.procs[idx].state = ProcState::Runnable;
        sched();
    }
    pop_off();
}

/// First-run entry for a freshly scheduled process.
///
/// The scheduler's push_off level is still active when the context
/// switch lands here; drop it, then head for user space.
pub(crate) extern "C" fn forkret() {
    pop_off();
    crate::trap::user_trap_return();
}

/// Park on `chan`, releasing `guard` for the duration.
///
/// The condition lock is dropped only after the process is marked
/// sleeping and interrupts stay off throughout, so a wakeup between the
/// caller's condition check and the switch cannot be lost. Re-acquires
/// the lock before returning; the caller re-checks its condition.
pub fn sleep<'a, T>(chan: usize, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let lock = guard.spinlock();

    push_off();
    let parked = {
        // SAFETY: interrupts are off.
        let cpu = unsafe { cpu_mut() };
        match cpu.current {
            Some(idx) => {
                // SAFETY: as above.
                let p = &mut unsafe { table_mut() }.procs[idx];
                p.chan = chan;
                p.state = ProcState::Sleeping;
                drop(guard);
                sched();
                let p = &mut unsafe { table_mut() }.procs[idx];
                p.chan = 0;
                true
            }
            None => {
                drop(guard);
                false
            }
        }
    };
    pop_off();

    if !parked {
        // No process context (early boot, hosted tests): behave as a
        // spurious wakeup and let the caller re-poll its condition.
        core::hint::spin_loop();
    }
    lock.lock()
}

/// Make every process sleeping on `chan` runnable.
pub fn wakeup(chan: usize) {
    push_off();
    // SAFETY: interrupts are off.
    let cur = unsafe { cpu_mut() }.current;
    // SAFETY: as above.
    let table = unsafe { table_mut() };
    for (i, p) in table.procs.iter_mut().enumerate() {
        if Some(i) != cur && p.state == ProcState::Sleeping && p.chan == chan {
            p.state = ProcState::Runnable;
        }
    }
    pop_off();
}

/// Sleep variant for callers that manage their own push_off region
/// instead of a lock guard (wait, exit). Expects exactly one push_off
/// level; returns with the same level held.
pub(crate) fn sleep_here(chan: usize) {
    // SAFETY: caller holds the push_off region per the contract.
    let cpu = unsafe { cpu_mut() };
    let Some(idx) = cpu.current else {
        core::hint::spin_loop();
        return;
    };
    // SAFETY: as above.
    let p = &mut unsafe { table_mut() }.procs[idx];
    p.chan = chan;
    p.state = ProcState::Sleeping;
    sched();
    // SAFETY: back on the CPU with interrupts still off.
    unsafe { table_mut() }.procs[idx].chan = 0;
}
