//! Hardware access layer: CSRs, fences, and interrupt control.
//!
//! On the bare-metal riscv64 target this wraps the `riscv` crate plus a
//! few raw CSR instructions the crate does not expose (`stimecmp` from
//! the sstc extension). On hosted targets (unit tests) every operation is
//! a stub: CSR writes vanish and the interrupt-enable flag becomes a
//! thread-local so the push_off/pop_off discipline stays observable.

pub mod plic;

/// Supervisor trap cause: environment call from U-mode.
pub const SCAUSE_ECALL_U: usize = 8;
/// Supervisor trap cause: instruction page fault.
pub const SCAUSE_INST_PAGE_FAULT: usize = 12;
/// Supervisor trap cause: load page fault.
pub const SCAUSE_LOAD_PAGE_FAULT: usize = 13;
/// Supervisor trap cause: store page fault.
pub const SCAUSE_STORE_PAGE_FAULT: usize = 15;
/// Interrupt bit of scause.
pub const SCAUSE_INTERRUPT: usize = 1 << 63;
/// Supervisor timer interrupt cause (interrupt bit stripped).
pub const IRQ_S_TIMER: usize = 5;
/// Supervisor external interrupt cause (interrupt bit stripped).
pub const IRQ_S_EXTERNAL: usize = 9;

/// This kernel runs a single hart.
pub const BOOT_HART: usize = 0;

#[cfg(target_arch = "riscv64")]
mod imp {
    use riscv::register::{scause, sepc, sie, sstatus, stval, stvec};

    /// Hart ID of the executing core. Single hart, so always zero; the
    /// trap frame still records it because the trampoline reloads `tp`
    /// from there.
    #[inline]
    pub fn cpu_id() -> usize {
        super::BOOT_HART
    }

    /// Enable supervisor interrupts.
    #[inline]
    pub fn intr_on() {
        // SAFETY: flipping SSTATUS.SIE is the architectural way to accept
        // pending supervisor interrupts; callers only do this outside
        // spinlock critical sections.
        unsafe { sstatus::set_sie() }
    }

    /// Disable supervisor interrupts.
    #[inline]
    pub fn intr_off() {
        // SAFETY: clearing SSTATUS.SIE cannot violate memory safety.
        unsafe { sstatus::clear_sie() }
    }

    /// Are supervisor interrupts enabled?
    #[inline]
    pub fn intr_get() -> bool {
        sstatus::read().sie()
    }

    /// Enable external, timer, and software interrupt sources in `sie`.
    pub fn enable_interrupt_sources() {
        // SAFETY: setting enable bits only allows traps the kernel
        // installs handlers for before calling this.
        unsafe {
            sie::set_sext();
            sie::set_stimer();
            sie::set_ssoft();
        }
    }

    /// Program the supervisor trap vector.
    ///
    /// # Safety
    ///
    /// `addr` must be the address of a valid trap entry routine, aligned
    /// as stvec requires.
    pub unsafe fn write_stvec(addr: usize) {
        // SAFETY: caller guarantees addr is a valid trap vector.
        unsafe { stvec::write(addr, stvec::TrapMode::Direct) }
    }

    /// Saved user program counter of the most recent trap.
    #[inline]
    pub fn read_sepc() -> usize {
        sepc::read()
    }

    /// Set the exception return address for the next `sret`.
    pub fn write_sepc(pc: usize) {
        // SAFETY: writing sepc only affects where sret resumes.
        unsafe {
            core::arch::asm!("csrw sepc, {}", in(reg) pc);
        }
    }

    /// Raw scause value of the current trap.
    #[inline]
    pub fn read_scause() -> usize {
        scause::read().bits()
    }

    /// Faulting address / trap-specific value.
    #[inline]
    pub fn read_stval() -> usize {
        stval::read()
    }

    /// Install a page table and flush the TLB.
    ///
    /// # Safety
    ///
    /// `satp_value` must encode a valid Sv39 root page table that maps
    /// the currently executing code.
    pub unsafe fn write_satp(satp_value: usize) {
        // SAFETY: caller guarantees the page table is live and maps the
        // executing kernel text; the fence flushes stale translations.
        unsafe {
            core::arch::asm!("csrw satp, {}", in(reg) satp_value);
            core::arch::asm!("sfence.vma zero, zero");
        }
    }

    /// Current satp (the kernel page-table token once paging is on).
    #[inline]
    pub fn read_satp() -> usize {
        let value: usize;
        // SAFETY: reading a CSR has no side effects.
        unsafe {
            core::arch::asm!("csrr {}, satp", out(reg) value);
        }
        value
    }

    /// Stash a value in sscratch (trap-stack pointer for kernelvec).
    pub fn write_sscratch(value: usize) {
        // SAFETY: sscratch is a scratch register with no architectural
        // side effects.
        unsafe {
            core::arch::asm!("csrw sscratch, {}", in(reg) value);
        }
    }

    /// Prepare sstatus for a return to user mode: previous privilege =
    /// user, previous interrupt enable = on.
    pub fn set_user_return_status() {
        // SAFETY: these bits only take effect at sret, which the caller
        // executes immediately after via the trampoline.
        unsafe {
            sstatus::set_spp(sstatus::SPP::User);
            sstatus::set_spie();
        }
    }

    /// Raw sstatus value (saved/restored around nested kernel traps).
    #[inline]
    pub fn read_sstatus() -> usize {
        let value: usize;
        // SAFETY: reading a CSR has no side effects.
        unsafe {
            core::arch::asm!("csrr {}, sstatus", out(reg) value);
        }
        value
    }

    /// Restore a raw sstatus value.
    ///
    /// # Safety
    ///
    /// `value` must be a value previously read by [`read_sstatus`] in
    /// the same trap nesting context.
    pub unsafe fn write_sstatus(value: usize) {
        // SAFETY: caller restores a previously observed value.
        unsafe {
            core::arch::asm!("csrw sstatus, {}", in(reg) value);
        }
    }

    /// Read the free-running time counter.
    #[inline]
    pub fn read_time() -> u64 {
        let cycles: u64;
        // SAFETY: rdtime reads the time counter without side effects.
        unsafe {
            core::arch::asm!("rdtime {}", out(reg) cycles);
        }
        cycles
    }

    /// Arm the supervisor timer via the sstc `stimecmp` CSR.
    pub fn write_stimecmp(deadline: u64) {
        // SAFETY: stimecmp (CSR 0x14D) only schedules the next timer
        // interrupt; firmware has enabled sstc for S-mode at boot.
        unsafe {
            core::arch::asm!("csrw 0x14d, {}", in(reg) deadline);
        }
    }

    /// Wait for an interrupt (low-power scheduler idle).
    #[inline]
    pub fn wait_for_interrupt() {
        // SAFETY: wfi stalls until an interrupt is pending; resuming is
        // always safe.
        unsafe {
            core::arch::asm!("wfi");
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod imp {
    //! Hosted stubs. CSR state collapses to a thread-local interrupt
    //! flag so lock bookkeeping can be unit tested.

    use core::cell::Cell;

    std::thread_local! {
        static INTR_ENABLED: Cell<bool> = const { Cell::new(false) };
    }

    pub fn cpu_id() -> usize {
        super::BOOT_HART
    }

    pub fn intr_on() {
        INTR_ENABLED.with(|f| f.set(true));
    }

    pub fn intr_off() {
        INTR_ENABLED.with(|f| f.set(false));
    }

    pub fn intr_get() -> bool {
        INTR_ENABLED.with(|f| f.get())
    }

    pub fn enable_interrupt_sources() {}

    /// # Safety
    ///
    /// No-op on hosted targets.
    pub unsafe fn write_stvec(_addr: usize) {}

    pub fn read_sepc() -> usize {
        0
    }

    pub fn write_sepc(_pc: usize) {}

    pub fn read_scause() -> usize {
        0
    }

    pub fn read_stval() -> usize {
        0
    }

    /// # Safety
    ///
    /// No-op on hosted targets.
    pub unsafe fn write_satp(_satp_value: usize) {}

    pub fn read_satp() -> usize {
        0
    }

    pub fn write_sscratch(_value: usize) {}

    pub fn set_user_return_status() {}

    pub fn read_sstatus() -> usize {
        0
    }

    /// # Safety
    ///
    /// No-op on hosted targets.
    pub unsafe fn write_sstatus(_value: usize) {}

    pub fn read_time() -> u64 {
        0
    }

    pub fn write_stimecmp(_deadline: u64) {}

    pub fn wait_for_interrupt() {}
}

pub use imp::*;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_round_trips() {
        intr_off();
        assert!(!intr_get());
        intr_on();
        assert!(intr_get());
        intr_off();
        assert!(!intr_get());
    }
}
