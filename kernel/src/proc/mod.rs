//! Processes: control blocks, the process table, and cross-address-space
//! copies.
//!
//! PCBs live in a fixed arena indexed by slot number; slot indices are
//! the kernel's stable process identity (parent links, wait scans),
//! while pids are monotonically increasing and never reused.
//!
//! The table and the CPU state are guarded by interrupts-off regions on
//! the single hart rather than a lock object: the scheduler must hold
//! access across a context switch, which no RAII guard can span.

pub mod lifecycle;
pub mod loader;
pub mod scheduler;

pub use scheduler::{scheduler, sleep, wakeup, yield_cpu};

use core::cell::UnsafeCell;

use crate::error::{KernelError, KernelResult};
use crate::fs::file::FileRef;
use crate::fs::inode::InodeRef;
use crate::memlayout::{kstack, TRAMPOLINE, TRAPFRAME};
use crate::mm::{frame, uvm, PageTable, PhysAddr, PteFlags};
use crate::param::{NOFILE, NPROC};
use crate::sync::spinlock::{pop_off, push_off};
use crate::trap;

/// Process name length (diagnostics).
pub const NAME_LEN: usize = 16;

/// Callee-saved register context for the cooperative kernel switch.
/// Field order is the `swtch` assembly contract.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Saved user state across a user->kernel transition. The trampoline
/// assembly indexes this structure by fixed byte offsets; the field
/// order is load-bearing.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// Kernel page-table token (satp).
    pub kernel_satp: usize, // 0
    /// Top of this process's kernel stack.
    pub kernel_sp: usize, // 8
    /// Address of the kernel-side user trap handler.
    pub kernel_trap: usize, // 16
    /// Saved user program counter.
    pub epc: usize, // 24
    /// Hart ID, reloaded into tp on user entry.
    pub kernel_hartid: usize, // 32
    pub ra: usize,  // 40
    pub sp: usize,  // 48
    pub gp: usize,  // 56
    pub tp: usize,  // 64
    pub t0: usize,  // 72
    pub t1: usize,  // 80
    pub t2: usize,  // 88
    pub s0: usize,  // 96
    pub s1: usize,  // 104
    pub a0: usize,  // 112
    pub a1: usize,  // 120
    pub a2: usize,  // 128
    pub a3: usize,  // 136
    pub a4: usize,  // 144
    pub a5: usize,  // 152
    pub a6: usize,  // 160
    pub a7: usize,  // 168
    pub s2: usize,  // 176
    pub s3: usize,  // 184
    pub s4: usize,  // 192
    pub s5: usize,  // 200
    pub s6: usize,  // 208
    pub s7: usize,  // 216
    pub s8: usize,  // 224
    pub s9: usize,  // 232
    pub s10: usize, // 240
    pub s11: usize, // 248
    pub t3: usize,  // 256
    pub t4: usize,  // 264
    pub t5: usize,  // 272
    pub t6: usize,  // 280
}

impl TrapFrame {
    /// Syscall argument register by index (a0..a5).
    pub fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("trap frame: argument index out of range"),
        }
    }
}

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot free.
    Unused,
    /// Slot claimed, not yet runnable.
    Allocated,
    /// Parked on a sleep channel.
    Sleeping,
    /// Ready for the scheduler.
    Runnable,
    /// Currently on the CPU.
    Running,
    /// Exited, awaiting wait().
    Zombie,
}

/// One process control block.
pub struct Pcb {
    pub state: ProcState,
    pub pid: i32,
    /// Parent's slot index. `None` only for init and unclaimed slots.
    pub parent: Option<usize>,
    pub killed: bool,
    /// Sleep channel; meaningful only in `Sleeping` state, compared by
    /// identity and never dereferenced.
    pub chan: usize,
    pub exit_status: i32,
    /// Kernel stack virtual address (bottom of the mapped page).
    pub kstack: usize,
    /// User memory high-water mark in bytes.
    pub sz: usize,
    pub pagetable: Option<PageTable>,
    /// Frame holding this process's trap frame.
    pub trapframe: Option<PhysAddr>,
    /// Saved kernel context for swtch.
    pub context: Context,
    pub name: [u8; NAME_LEN],
    pub ofile: [Option<FileRef>; NOFILE],
    pub cwd: Option<InodeRef>,
}

impl Pcb {
    const fn unused() -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            parent: None,
            killed: false,
            chan: 0,
            exit_status: 0,
            kstack: 0,
            sz: 0,
            pagetable: None,
            trapframe: None,
            context: Context::zeroed(),
            name: [0; NAME_LEN],
            ofile: [const { None }; NOFILE],
            cwd: None,
        }
    }

    /// The trap frame, which lives in its own frame.
    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        let pa = self.trapframe.expect("process has no trap frame");
        // SAFETY: the frame was allocated for exactly this purpose in
        // alloc() and stays owned by the PCB until free().
        unsafe { &mut *pa.as_mut_ptr::<TrapFrame>() }
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN - 1);
        self.name = [0; NAME_LEN];
        self.name[..n].copy_from_slice(&bytes[..n]);
    }
}

/// Per-hart state: the running process and the scheduler context.
pub struct Cpu {
    pub current: Option<usize>,
    pub context: Context,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            current: None,
            context: Context::zeroed(),
        }
    }
}

/// The process table.
pub struct ProcTable {
    pub procs: [Pcb; NPROC],
    next_pid: i32,
    /// Slot of the init process, target of reparenting.
    pub init_slot: Option<usize>,
}

impl ProcTable {
    pub const fn new() -> Self {
        Self {
            procs: [const { Pcb::unused() }; NPROC],
            next_pid: 1,
            init_slot: None,
        }
    }

    pub fn alloc_pid(&mut self) -> i32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }
}

struct RacyCell<T>(UnsafeCell<T>);

// SAFETY: access is confined to the single hart with interrupts
// disabled (bare metal) or to read-only peeks (hosted tests); see
// table_mut()/cpu_mut().
unsafe impl<T> Sync for RacyCell<T> {}

static TABLE: RacyCell<ProcTable> = RacyCell(UnsafeCell::new(ProcTable::new()));
static CPU0: RacyCell<Cpu> = RacyCell(UnsafeCell::new(Cpu::new()));

/// The process table.
///
/// # Safety
///
/// Caller must be on the single hart with interrupts disabled (inside a
/// push_off region), and must not hold the returned reference across a
/// point that re-enables interrupts other than a context switch.
pub(crate) unsafe fn table_mut() -> &'static mut ProcTable {
    // SAFETY: delegated to the caller per the function contract.
    unsafe { &mut *TABLE.0.get() }
}

/// This hart's CPU state.
///
/// # Safety
///
/// Same contract as [`table_mut`].
pub(crate) unsafe fn cpu_mut() -> &'static mut Cpu {
    // SAFETY: delegated to the caller per the function contract.
    unsafe { &mut *CPU0.0.get() }
}

/// Record each slot's kernel-stack virtual address. The stacks
/// themselves were mapped when the kernel page table was built.
pub fn init() {
    push_off();
    // SAFETY: interrupts are off on the boot hart.
    let table = unsafe { table_mut() };
    for (i, p) in table.procs.iter_mut().enumerate() {
        p.kstack = kstack(i);
    }
    pop_off();
    log::info!("proc: {} process slots", NPROC);
}

/// Slot index of the running process, if any.
pub fn current() -> Option<usize> {
    push_off();
    // SAFETY: interrupts are off; read-only peek at this hart's state.
    let cur = unsafe { (*CPU0.0.get()).current };
    pop_off();
    cur
}

/// pid of the running process.
pub fn current_pid() -> Option<i32> {
    push_off();
    // SAFETY: interrupts are off.
    let pid = unsafe {
        let cpu = &*CPU0.0.get();
        cpu.current.map(|i| (*TABLE.0.get()).procs[i].pid)
    };
    pop_off();
    pid
}

/// Has the running process been killed? False when there is no process
/// context (boot, hosted tests).
pub fn current_killed() -> bool {
    push_off();
    // SAFETY: interrupts are off.
    let killed = unsafe {
        let cpu = &*CPU0.0.get();
        cpu.current
            .map(|i| (*TABLE.0.get()).procs[i].killed)
            .unwrap_or(false)
    };
    pop_off();
    killed
}

/// Page table of the running process.
pub fn current_pagetable() -> Option<PageTable> {
    push_off();
    // SAFETY: interrupts are off.
    let pt = unsafe {
        let cpu = &*CPU0.0.get();
        cpu.current.and_then(|i| (*TABLE.0.get()).procs[i].pagetable)
    };
    pop_off();
    pt
}

/// Run a closure against the running process's PCB.
pub fn with_current<R>(f: impl FnOnce(&mut Pcb) -> R) -> Option<R> {
    push_off();
    // SAFETY: interrupts are off; the closure cannot yield (it receives
    // only the PCB).
    let r = unsafe {
        let cpu = &*CPU0.0.get();
        cpu.current.map(|i| f(&mut (*TABLE.0.get()).procs[i]))
    };
    pop_off();
    r
}

/// Mark a process killed; a sleeping victim is made runnable so it can
/// observe the flag and abort its syscall.
pub fn kill(pid: i32) -> bool {
    push_off();
    // SAFETY: interrupts are off.
    let table = unsafe { table_mut() };
    for p in table.procs.iter_mut() {
        if p.state != ProcState::Unused && p.pid == pid {
            p.killed = true;
            if p.state == ProcState::Sleeping {
                p.state = ProcState::Runnable;
            }
            pop_off();
            return true;
        }
    }
    pop_off();
    false
}

// ---------------------------------------------------------------------
// Allocation and teardown
// ---------------------------------------------------------------------

/// Build a fresh user page table containing only the trampoline and the
/// given trap-frame page.
pub(crate) fn create_user_pagetable(tf: PhysAddr) -> KernelResult<PageTable> {
    let frames = frame::allocator();
    let pt = PageTable::new(frames)?;
    if let Err(e) = pt.map(
        TRAMPOLINE,
        PhysAddr::new(trap::trampoline_addr()),
        PteFlags::R | PteFlags::X,
        frames,
    ) {
        pt.free(frames);
        return Err(e);
    }
    if let Err(e) = pt.map(TRAPFRAME, tf, PteFlags::R | PteFlags::W, frames) {
        pt.unmap(TRAMPOLINE, false, frames);
        pt.free(frames);
        return Err(e);
    }
    Ok(pt)
}

/// Tear down a user page table: drop the kernel-owned mappings, free the
/// user pages, then the tree.
pub(crate) fn free_user_pagetable(pt: PageTable, sz: usize) {
    let frames = frame::allocator();
    pt.unmap(TRAMPOLINE, false, frames);
    pt.unmap(TRAPFRAME, false, frames);
    uvm::free(pt, frames, sz);
}

/// Claim an UNUSED slot: assign a pid, allocate the trap-frame page and
/// an empty user page table, and point the saved context at the shared
/// first-run entry with the stack at the top of the slot's kernel stack.
pub(crate) fn alloc() -> KernelResult<usize> {
    push_off();
    // SAFETY: interrupts are off.
    let table = unsafe { table_mut() };
    let Some(idx) = table
        .procs
        .iter()
        .position(|p| p.state == ProcState::Unused)
    else {
        pop_off();
        return Err(KernelError::ResourceExhausted {
            resource: "process slots",
        });
    };
    let pid = table.alloc_pid();
    table.procs[idx].state = ProcState::Allocated;
    table.procs[idx].pid = pid;
    pop_off();

    let undo = |table_idx: usize| {
        push_off();
        // SAFETY: interrupts are off.
        let table = unsafe { table_mut() };
        table.procs[table_idx] = Pcb {
            kstack: table.procs[table_idx].kstack,
            ..Pcb::unused()
        };
        pop_off();
    };

    let tf = match frame::allocator().alloc() {
        Ok(f) => f,
        Err(e) => {
            undo(idx);
            return Err(e);
        }
    };
    let pt = match create_user_pagetable(tf) {
        Ok(pt) => pt,
        Err(e) => {
            frame::allocator().free(tf);
            undo(idx);
            return Err(e);
        }
    };

    push_off();
    // SAFETY: interrupts are off.
    let table = unsafe { table_mut() };
    let p = &mut table.procs[idx];
    p.trapframe = Some(tf);
    p.pagetable = Some(pt);
    p.context = Context::zeroed();
    p.context.ra = scheduler::forkret as usize;
    p.context.sp = p.kstack + crate::mm::PAGE_SIZE;
    pop_off();
    Ok(idx)
}

/// Release everything a reaped process still owns and return the slot.
/// Caller runs inside a push_off region.
pub(crate) fn free_slot(p: &mut Pcb) {
    if let Some(tf) = p.trapframe.take() {
        frame::allocator().free(tf);
    }
    if let Some(pt) = p.pagetable.take() {
        free_user_pagetable(pt, p.sz);
    }
    *p = Pcb {
        kstack: p.kstack,
        ..Pcb::unused()
    };
}

// ---------------------------------------------------------------------
// Cross-address-space copies
// ---------------------------------------------------------------------

/// Copy `src` to a user virtual address (`user == true`) or a kernel
/// pointer.
pub fn either_copy_out(user: bool, dst: usize, src: &[u8]) -> KernelResult<()> {
    if user {
        let pt = current_pagetable().ok_or(KernelError::BadAddress { addr: dst })?;
        uvm::copy_out(&pt, dst, src)
    } else {
        // SAFETY: non-user destinations come from kernel callers that
        // own the buffer (console, directory entries, loader).
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
        }
        Ok(())
    }
}

/// Fill `dst` from a user virtual address (`user == true`) or a kernel
/// pointer.
pub fn either_copy_in(user: bool, dst: &mut [u8], src: usize) -> KernelResult<()> {
    if user {
        let pt = current_pagetable().ok_or(KernelError::BadAddress { addr: src })?;
        uvm::copy_in(&pt, dst, src)
    } else {
        // SAFETY: as in either_copy_out.
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn trapframe_layout_matches_assembly_contract() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(TrapFrame, kernel_satp), 0);
        assert_eq!(offset_of!(TrapFrame, kernel_sp), 8);
        assert_eq!(offset_of!(TrapFrame, kernel_trap), 16);
        assert_eq!(offset_of!(TrapFrame, epc), 24);
        assert_eq!(offset_of!(TrapFrame, kernel_hartid), 32);
        assert_eq!(offset_of!(TrapFrame, ra), 40);
        assert_eq!(offset_of!(TrapFrame, sp), 48);
        assert_eq!(offset_of!(TrapFrame, a0), 112);
        assert_eq!(offset_of!(TrapFrame, a7), 168);
        assert_eq!(offset_of!(TrapFrame, t6), 280);
        assert_eq!(core::mem::size_of::<TrapFrame>(), 288);
    }

    #[test]
    fn context_layout_matches_swtch_contract() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(Context, ra), 0);
        assert_eq!(offset_of!(Context, sp), 8);
        assert_eq!(offset_of!(Context, s0), 16);
        assert_eq!(offset_of!(Context, s11), 104);
        assert_eq!(core::mem::size_of::<Context>(), 112);
    }

    #[test]
    fn pids_increase_and_never_repeat() {
        let mut t = ProcTable::new();
        let a = t.alloc_pid();
        let b = t.alloc_pid();
        let c = t.alloc_pid();
        assert!(a < b && b < c);
    }

    #[test]
    fn name_is_truncated_and_nul_terminated() {
        let mut p = Pcb::unused();
        p.set_name("a-very-long-process-name");
        assert_eq!(p.name[NAME_LEN - 1], 0);
        assert_eq!(&p.name[..4], b"a-ve");
    }
}
