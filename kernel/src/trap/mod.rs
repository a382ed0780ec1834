//! Trap handling: exception/interrupt dispatch for both kernel and user
//! mode, and the user-return path through the trampoline.
//!
//! External device interrupts go through a small registry keyed by PLIC
//! source number: claim, dispatch to the registered handler, complete.
//! Timer interrupts bump the tick counter and preempt whoever is
//! running. Page faults in kernel or user mode are fatal, with a
//! dedicated diagnosis for kernel-stack guard-page hits.

pub mod timer;

use crate::arch::{
    self, plic, IRQ_S_EXTERNAL, IRQ_S_TIMER, SCAUSE_ECALL_U, SCAUSE_INST_PAGE_FAULT,
    SCAUSE_INTERRUPT, SCAUSE_LOAD_PAGE_FAULT, SCAUSE_STORE_PAGE_FAULT,
};
use crate::memlayout::kstack;
use crate::mm::PAGE_SIZE;
use crate::param::NPROC;
use crate::proc::{self, ProcState};
use crate::sync::spinlock::SpinLock;

/// Highest PLIC source number the registry covers.
const MAX_IRQ: usize = 32;

static IRQ_HANDLERS: SpinLock<[Option<fn()>; MAX_IRQ]> =
    SpinLock::new("irqtable", [None; MAX_IRQ]);

/// Register a handler for a PLIC interrupt source. Double registration
/// is a wiring bug and fatal.
pub fn register_irq(irq: u32, handler: fn()) {
    let mut handlers = IRQ_HANDLERS.lock();
    let slot = handlers
        .get_mut(irq as usize)
        .unwrap_or_else(|| panic!("irq {} out of range", irq));
    if slot.is_some() {
        panic!("irq {} already registered", irq);
    }
    *slot = Some(handler);
}

/// Remove a registered handler.
pub fn unregister_irq(irq: u32) {
    let mut handlers = IRQ_HANDLERS.lock();
    let slot = handlers
        .get_mut(irq as usize)
        .unwrap_or_else(|| panic!("irq {} out of range", irq));
    if slot.is_none() {
        panic!("irq {} was not registered", irq);
    }
    *slot = None;
}

// ---------------------------------------------------------------------
// Assembly collaborators (trampoline.S, kernelvec.S)
// ---------------------------------------------------------------------

#[cfg(target_os = "none")]
extern "C" {
    /// Start of the trampoline page (mapped at TRAMPOLINE everywhere).
    static trampoline: u8;
    /// User-entry code within the trampoline.
    static uservec: u8;
    /// User-return code within the trampoline.
    static userret: u8;
    /// Kernel-mode trap vector.
    fn kernelvec();
}

/// Physical address of the trampoline page.
#[cfg(target_os = "none")]
pub fn trampoline_addr() -> usize {
    // SAFETY: linker-provided symbol address.
    unsafe { &trampoline as *const u8 as usize }
}

/// Hosted stub: a stable page-aligned dummy so user page tables can be
/// built in tests.
#[cfg(not(target_os = "none"))]
pub fn trampoline_addr() -> usize {
    0x8000_0000
}

/// Point stvec at the kernel-mode trap entry.
fn set_kernel_vector() {
    #[cfg(target_os = "none")]
    // SAFETY: kernelvec is the assembly kernel trap entry.
    unsafe {
        arch::write_stvec(kernelvec as usize);
    }
}

/// Install the kernel trap vector on this hart.
pub fn init_hart() {
    set_kernel_vector();
    log::info!("trap: kernel vector installed");
}

// ---------------------------------------------------------------------
// Kernel-mode traps
// ---------------------------------------------------------------------

/// Entry from kernelvec after it has saved all registers on the current
/// kernel stack.
#[no_mangle]
pub extern "C" fn kernel_trap() {
    let sepc = arch::read_sepc();
    let sstatus = arch::read_sstatus();
    let cause = arch::read_scause();

    if cause & SCAUSE_INTERRUPT != 0 {
        handle_interrupt(cause & !SCAUSE_INTERRUPT, true);
    } else {
        kernel_exception(cause, sepc);
    }

    // A yield may have run other traps; restore this trap's return
    // state before kernelvec's sret.
    arch::write_sepc(sepc);
    // SAFETY: restoring the exact value read at entry.
    unsafe { arch::write_sstatus(sstatus) };
}

/// Shared interrupt dispatch. `in_kernel` selects the preemption rule:
/// kernel-mode timer ticks yield in place, user-mode ticks yield on the
/// way out of usertrap.
fn handle_interrupt(code: usize, in_kernel: bool) {
    match code {
        IRQ_S_TIMER => {
            timer::tick();
            if in_kernel && running_process_exists() {
                proc::yield_cpu();
            }
        }
        IRQ_S_EXTERNAL => external_interrupt(),
        _ => {
            log::warn!("trap: unhandled interrupt cause {}", code);
        }
    }
}

/// Claim/dispatch/complete cycle against the PLIC.
fn external_interrupt() {
    while let Some(irq) = plic::claim(arch::cpu_id()) {
        let handler = IRQ_HANDLERS.lock().get(irq as usize).copied().flatten();
        match handler {
            Some(h) => h(),
            None => log::warn!("trap: unexpected external irq {}", irq),
        }
        plic::complete(arch::cpu_id(), irq);
    }
}

fn running_process_exists() -> bool {
    proc::with_current(|p| p.state == ProcState::Running).unwrap_or(false)
}

fn kernel_exception(cause: usize, sepc: usize) -> ! {
    let stval = arch::read_stval();

    if matches!(
        cause,
        SCAUSE_INST_PAGE_FAULT | SCAUSE_LOAD_PAGE_FAULT | SCAUSE_STORE_PAGE_FAULT
    ) {
        // A fault in a kernel-stack guard page is an overflow, which
        // deserves a better epitaph than a bare page fault.
        for i in 0..NPROC {
            let base = kstack(i);
            if stval >= base - PAGE_SIZE && stval < base {
                panic!(
                    "kernel stack overflow: slot {} guard page hit at {:#x} (pc {:#x})",
                    i, stval, sepc
                );
            }
        }
        panic!(
            "kernel page fault: cause {} at {:#x} (pc {:#x})",
            cause, stval, sepc
        );
    }

    panic!(
        "kernel trap: unhandled exception cause {} at pc {:#x} (stval {:#x})",
        cause, sepc, stval
    );
}

// ---------------------------------------------------------------------
// User-mode traps
// ---------------------------------------------------------------------

/// Entry from the trampoline once it has switched to the kernel page
/// table and stack. Address recorded in every trap frame.
#[no_mangle]
pub extern "C" fn user_trap() {
    // Traps from here on are kernel traps.
    set_kernel_vector();

    proc::with_current(|p| {
        p.trapframe_mut().epc = arch::read_sepc();
    })
    .expect("user trap without a process");

    let cause = arch::read_scause();
    let mut from_timer = false;

    if cause == SCAUSE_ECALL_U {
        if proc::current_killed() {
            proc::lifecycle::exit(-1);
        }
        // Resume after the ecall instruction, not at it.
        proc::with_current(|p| p.trapframe_mut().epc += 4);
        // The syscall may sleep; let device interrupts in.
        arch::intr_on();
        crate::syscall::dispatch();
    } else if cause & SCAUSE_INTERRUPT != 0 {
        let code = cause & !SCAUSE_INTERRUPT;
        from_timer = code == IRQ_S_TIMER;
        handle_interrupt(code, false);
    } else if matches!(
        cause,
        SCAUSE_INST_PAGE_FAULT | SCAUSE_LOAD_PAGE_FAULT | SCAUSE_STORE_PAGE_FAULT
    ) {
        panic!(
            "user page fault: pid {} at {:#x} (pc {:#x})",
            proc::current_pid().unwrap_or(-1),
            arch::read_stval(),
            arch::read_sepc()
        );
    } else {
        log::warn!(
            "trap: unexpected user trap cause {:#x}, pid {}; killing",
            cause,
            proc::current_pid().unwrap_or(-1)
        );
        proc::with_current(|p| p.killed = true);
    }

    if proc::current_killed() {
        proc::lifecycle::exit(-1);
    }
    if from_timer {
        proc::yield_cpu();
    }

    user_trap_return();
}

/// Return to user space through the trampoline.
pub fn user_trap_return() -> ! {
    #[cfg(not(target_os = "none"))]
    unreachable!("no user space on hosted targets");

    #[cfg(target_os = "none")]
    {
        use crate::memlayout::TRAMPOLINE;
        use crate::mm::kvm;

        // Between switching stvec to the user vector and the sret in the
        // trampoline, a trap would be misrouted; keep interrupts off.
        arch::intr_off();

        // SAFETY: linker symbols within the trampoline page.
        let (tramp_base, tramp_uservec, tramp_userret) = unsafe {
            (
                &trampoline as *const u8 as usize,
                &uservec as *const u8 as usize,
                &userret as *const u8 as usize,
            )
        };

        // SAFETY: the trampoline's user vector is mapped at TRAMPOLINE in
        // every address space.
        unsafe {
            arch::write_stvec(TRAMPOLINE + (tramp_uservec - tramp_base));
        }

        let satp = proc::with_current(|p| {
            let kstack_top = p.kstack + PAGE_SIZE;
            let pt = p.pagetable.expect("returning process has a page table");
            let tf = p.trapframe_mut();
            tf.kernel_satp = kvm::kernel_satp();
            tf.kernel_sp = kstack_top;
            tf.kernel_trap = user_trap as usize;
            tf.kernel_hartid = arch::cpu_id();
            arch::write_sepc(tf.epc);
            pt.satp()
        })
        .expect("user return without a process");

        arch::set_user_return_status();

        // Jump to userret(satp) at its trampoline virtual address; it
        // switches page tables, restores user registers, and srets.
        let userret_va = TRAMPOLINE + (tramp_userret - tramp_base);
        // SAFETY: userret is trampoline code expecting the user satp in
        // a0 and never returning.
        unsafe {
            let f: extern "C" fn(usize) -> ! = core::mem::transmute(userret_va);
            f(satp)
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn irq_registry_round_trips() {
        fn dummy() {}
        register_irq(21, dummy);
        unregister_irq(21);
        register_irq(21, dummy);
        unregister_irq(21);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration_is_fatal() {
        fn dummy() {}
        register_irq(22, dummy);
        register_irq(22, dummy);
    }
}
