//! Process lifecycle: the first process, fork, exit, and wait.

use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::fs::file;
use crate::mm::{frame, uvm, PteFlags, PAGE_SIZE};
use crate::param::{NOFILE, NPROC, ROOTDEV};
use crate::proc::{self, scheduler, ProcState};
use crate::sync::spinlock::{pop_off, push_off};

/// The assembled bootstrap program planted at user address 0 by
/// [`user_init`]: it execs `/init` and loops on exit if that fails.
///
/// ```text
/// start: auipc a0, 0          # a0 = &"/init"
///        addi  a0, a0, 0x28
///        auipc a1, 0          # a1 = &argv
///        addi  a1, a1, 0x28
///        li    a7, SYS_exec
///        ecall
/// exit:  li    a7, SYS_exit
///        ecall
///        jal   exit
/// ```
#[rustfmt::skip]
static INITCODE: [u8; 64] = [
    0x17, 0x05, 0x00, 0x00, // auipc a0, 0
    0x13, 0x05, 0x85, 0x02, // addi  a0, a0, 40
    0x97, 0x05, 0x00, 0x00, // auipc a1, 0
    0x93, 0x85, 0x85, 0x02, // addi  a1, a1, 40
    0x93, 0x08, 0x50, 0x00, // li    a7, 5 (exec)
    0x73, 0x00, 0x00, 0x00, // ecall
    0x93, 0x08, 0x20, 0x00, // li    a7, 2 (exit)
    0x73, 0x00, 0x00, 0x00, // ecall
    0x6f, 0xf0, 0x9f, 0xff, // jal   -8
    0x00, 0x00, 0x00, 0x00, // (pad)
    b'/', b'i', b'n', b'i', // "/init\0"
    b't', 0x00, 0x00, 0x00,
    0x28, 0x00, 0x00, 0x00, // argv[0] = 0x28
    0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, // argv[1] = 0
    0x00, 0x00, 0x00, 0x00,
];

/// Create the first process: the init bootstrap at virtual address 0
/// with a stack page above it, current directory at the filesystem
/// root.
pub fn user_init() {
    let idx = proc::alloc().expect("user_init: no process slot");
    let frames = frame::allocator();

    push_off();
    // SAFETY: interrupts are off.
    let table = unsafe { proc::table_mut() };
    let p = &mut table.procs[idx];
    let pt = p.pagetable.expect("allocated process has a page table");
    pop_off();

    // Code page at va 0, stack page right above it.
    uvm::first_page(&pt, frames, &INITCODE, PteFlags::R | PteFlags::X)
        .expect("user_init: mapping initcode");
    uvm::alloc(&pt, frames, PAGE_SIZE, 2 * PAGE_SIZE, PteFlags::W)
        .expect("user_init: mapping stack");

    let cwd = fs::fs()
        .iget(ROOTDEV, fs::ROOT_INO)
        .expect("user_init: root inode");

    push_off();
    // SAFETY: interrupts are off.
    let table = unsafe { proc::table_mut() };
    table.init_slot = Some(idx);
    let p = &mut table.procs[idx];
    p.sz = 2 * PAGE_SIZE;
    p.cwd = Some(cwd);
    p.set_name("init");
    let tf = p.trapframe_mut();
    tf.epc = 0;
    tf.sp = 2 * PAGE_SIZE;
    p.state = ProcState::Runnable;
    pop_off();

    log::info!("proc: init process ready");
}

/// Duplicate the calling process. Returns the child's pid to the parent;
/// the child wakes up in the middle of its copied trap frame with a0=0.
pub fn fork() -> KernelResult<i32> {
    let parent_idx = proc::current().ok_or(KernelError::InvalidArgument { name: "no process" })?;
    let child_idx = proc::alloc()?;
    let frames = frame::allocator();

    // Snapshot what we need from the parent without holding the table
    // across the (long) memory copy.
    let (parent_pt, parent_sz, parent_tf) = proc::with_current(|p| {
        (
            p.pagetable.expect("running process has a page table"),
            p.sz,
            *p.trapframe_mut(),
        )
    })
    .expect("fork: current process vanished");

    let child_pt = {
        push_off();
        // SAFETY: interrupts are off.
        let pt = unsafe { proc::table_mut() }.procs[child_idx]
            .pagetable
            .expect("allocated process has a page table");
        pop_off();
        pt
    };

    if let Err(e) = uvm::copy(&parent_pt, &child_pt, frames, parent_sz) {
        push_off();
        // SAFETY: interrupts are off.
        proc::free_slot(&mut unsafe { proc::table_mut() }.procs[child_idx]);
        pop_off();
        return Err(e);
    }

    // Share open files and the working directory.
    let fsys = fs::fs();
    let ftable = file::table();
    let mut ofile = [const { None }; NOFILE];
    let mut cwd = None;
    proc::with_current(|p| {
        for (i, f) in p.ofile.iter().enumerate() {
            ofile[i] = f.map(|fref| ftable.dup(fref));
        }
        cwd = p.cwd.map(|c| fsys.idup(c));
    });

    let child_pid;
    {
        push_off();
        // SAFETY: interrupts are off.
        let table = unsafe { proc::table_mut() };
        let child = &mut table.procs[child_idx];
        child.sz = parent_sz;
        *child.trapframe_mut() = parent_tf;
        child.trapframe_mut().a0 = 0; // fork returns 0 in the child
        child.ofile = ofile;
        child.cwd = cwd;
        child.parent = Some(parent_idx);
        child_pid = child.pid;
        let name = table.procs[parent_idx].name;
        table.procs[child_idx].name = name;
        table.procs[child_idx].state = ProcState::Runnable;
        pop_off();
    }
    Ok(child_pid)
}

/// Terminate the calling process. Open files and the working directory
/// are released, children are handed to init, the parent is woken, and
/// the slot lingers as a zombie until wait() reaps it.
pub fn exit(status: i32) -> ! {
    let idx = proc::current().expect("exit: no process");

    push_off();
    // SAFETY: interrupts are off.
    let table = unsafe { proc::table_mut() };
    if table.init_slot == Some(idx) {
        panic!("init exiting");
    }
    pop_off();

    // Release file resources before giving up the CPU for good; these
    // paths can sleep, so no table access is held across them.
    let fsys = fs::fs();
    let ftable = file::table();
    let mut ofile = [const { None }; NOFILE];
    let mut cwd = None;
    proc::with_current(|p| {
        for (i, f) in p.ofile.iter_mut().enumerate() {
            ofile[i] = f.take();
        }
        cwd = p.cwd.take();
    });
    for f in ofile.into_iter().flatten() {
        ftable.close(f, fsys);
    }
    if let Some(c) = cwd {
        fsys.log.begin_op(fsys);
        fsys.iput(c);
        let _ = fsys.log.end_op(fsys);
    }

    push_off();
    // SAFETY: interrupts are off from here through the final switch.
    let table = unsafe { proc::table_mut() };
    let init_slot = table.init_slot.expect("exit before init exists");

    // Hand children to init so they are always reaped.
    let mut orphaned = false;
    for p in table.procs.iter_mut() {
        if p.parent == Some(idx) {
            p.parent = Some(init_slot);
            orphaned = true;
        }
    }

    let parent = table.procs[idx].parent;
    table.procs[idx].exit_status = status;
    table.procs[idx].state = ProcState::Zombie;

    if let Some(parent_idx) = parent {
        let chan = proc_chan(parent_idx);
        wake_locked(chan);
    }
    if orphaned {
        wake_locked(proc_chan(init_slot));
    }

    scheduler::sched();
    unreachable!("zombie process scheduled again");
}

/// Sleep channel identifying a process slot (used by wait/exit).
fn proc_chan(idx: usize) -> usize {
    push_off();
    // SAFETY: interrupts are off; address-of only.
    let chan = unsafe { &proc::table_mut().procs[idx] as *const _ as usize };
    pop_off();
    chan
}

/// wakeup() for callers already inside a push_off region.
fn wake_locked(chan: usize) {
    // SAFETY: caller holds the push_off region.
    let cur = unsafe { proc::cpu_mut() }.current;
    let table = unsafe { proc::table_mut() };
    for (i, p) in table.procs.iter_mut().enumerate() {
        if Some(i) != cur && p.state == ProcState::Sleeping && p.chan == chan {
            p.state = ProcState::Runnable;
        }
    }
}

/// Wait for any child to exit; copies its status to `status_va` (if
/// non-zero) and returns its pid. Returns an error if the caller has no
/// children or was killed while waiting.
pub fn wait(status_va: usize) -> KernelResult<i32> {
    let me = proc::current().ok_or(KernelError::InvalidArgument { name: "no process" })?;
    let my_chan = proc_chan(me);

    push_off();
    loop {
        // SAFETY: interrupts are off for each pass.
        let table = unsafe { proc::table_mut() };
        let mut have_children = false;

        for i in 0..NPROC {
            if table.procs[i].parent != Some(me) || table.procs[i].state == ProcState::Unused {
                continue;
            }
            have_children = true;
            if table.procs[i].state == ProcState::Zombie {
                let pid = table.procs[i].pid;
                let status = table.procs[i].exit_status;
                if status_va != 0 {
                    if let Err(e) =
                        proc::either_copy_out(true, status_va, &status.to_le_bytes())
                    {
                        pop_off();
                        return Err(e);
                    }
                }
                // SAFETY: still inside the push_off region.
                proc::free_slot(&mut unsafe { proc::table_mut() }.procs[i]);
                pop_off();
                return Ok(pid);
            }
        }

        if !have_children {
            pop_off();
            return Err(KernelError::InvalidArgument { name: "no children" });
        }
        if proc::current_killed() {
            pop_off();
            return Err(KernelError::Interrupted);
        }

        // Sleep on our own PCB; exiting children wake this channel.
        scheduler::sleep_here(my_chan);
    }
}

/// Grow or shrink the user heap by `delta` bytes. Returns the previous
/// size (the classic sbrk contract).
pub fn grow(delta: isize) -> KernelResult<usize> {
    let (pt, old_sz) = proc::with_current(|p| {
        (p.pagetable.expect("running process has a page table"), p.sz)
    })
    .ok_or(KernelError::InvalidArgument { name: "no process" })?;

    let frames = frame::allocator();
    let new_sz = if delta >= 0 {
        uvm::alloc(
            &pt,
            frames,
            old_sz,
            old_sz + delta as usize,
            PteFlags::W,
        )?
    } else {
        let shrink = (-delta) as usize;
        let target = old_sz.saturating_sub(shrink);
        uvm::dealloc(&pt, frames, old_sz, target)
    };

    proc::with_current(|p| p.sz = new_sz);
    Ok(old_sz)
}
