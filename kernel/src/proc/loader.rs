//! ELF64 loading and exec.
//!
//! The loader builds a complete new address space before touching the
//! calling process: segments first, then one stack page, then the
//! argument vectors copied out in the new space. The commit point is
//! swapping the page-table pointer; any failure before that leaves the
//! caller exactly as it was.

use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::{self, InodeType};
use crate::mm::{frame, page_round_up, uvm, PageTable, PteFlags, PAGE_SIZE};
use crate::param::MAXARG;
use crate::proc::{self, ProcState};
use crate::sync::spinlock::{pop_off, push_off};

/// ELF magic: 0x7F "ELF".
const ELF_MAGIC: u32 = 0x464C_457F;

/// Program header type: loadable segment.
const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

/// ELF64 file header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ElfHeader {
    magic: u32,
    elf: [u8; 12],
    typ: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// ELF64 program header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ProgHeader {
    typ: u32,
    flags: u32,
    off: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

fn perm_from_flags(flags: u32) -> PteFlags {
    let mut perm = PteFlags::empty();
    if flags & PF_R != 0 {
        perm |= PteFlags::R;
    }
    if flags & PF_W != 0 {
        perm |= PteFlags::W;
    }
    if flags & PF_X != 0 {
        perm |= PteFlags::X;
    }
    perm
}

/// Read a packed structure out of an inode at `off`.
fn read_struct<T: Copy>(
    guard: &mut fs::inode::InodeGuard<'_>,
    off: u32,
) -> KernelResult<Option<T>> {
    let size = core::mem::size_of::<T>();
    let mut raw = [0u8; 128];
    assert!(size <= raw.len());
    let n = guard.read(false, raw.as_mut_ptr() as usize, off, size)?;
    if n != size {
        return Ok(None);
    }
    // SAFETY: T is a repr(C) plain-old-data header type; any bit pattern
    // is a valid value, and validity is checked by the caller.
    Ok(Some(unsafe {
        core::ptr::read_unaligned(raw.as_ptr() as *const T)
    }))
}

/// Load one segment's file content into the already-mapped pages of
/// `pt`.
fn load_segment(
    pt: &PageTable,
    guard: &mut fs::inode::InodeGuard<'_>,
    va: usize,
    file_off: u32,
    filesz: usize,
) -> KernelResult<()> {
    let mut loaded = 0;
    while loaded < filesz {
        let page_va = va + loaded;
        debug_assert_eq!(page_va % PAGE_SIZE, 0, "segments are page-aligned");
        let (pa, _) = pt
            .translate(page_va)
            .ok_or(FsError::BadExecutable)?;
        let n = PAGE_SIZE.min(filesz - loaded);
        let got = guard.read(false, pa.as_usize(), file_off + loaded as u32, n)?;
        if got != n {
            return Err(FsError::BadExecutable.into());
        }
        loaded += n;
    }
    Ok(())
}

/// Replace the calling process's image with the executable at `path`.
///
/// `args` are kernel-side copies of the argument strings. On success
/// returns argc (which lands in a0, becoming main's first argument); on
/// failure the caller's address space is untouched.
pub fn exec(path: &[u8], args: &[&[u8]]) -> KernelResult<usize> {
    if args.len() > MAXARG {
        return Err(KernelError::InvalidArgument { name: "argv" });
    }
    let idx = proc::current().ok_or(KernelError::InvalidArgument { name: "no process" })?;

    let fsys = fs::fs();
    let cwd = proc::with_current(|p| p.cwd).flatten();
    let tf_frame = proc::with_current(|p| p.trapframe.expect("process has a trap frame"))
        .expect("exec: current process vanished");

    fsys.log.begin_op(fsys);
    let result = (|| -> KernelResult<(PageTable, usize, usize, usize, usize)> {
        let ip = fsys.namei(path, cwd)?;
        let mut guard = match fsys.ilock(ip) {
            Ok(g) => g,
            Err(e) => {
                fsys.iput(ip);
                return Err(e);
            }
        };
        if guard.typ != InodeType::File {
            drop(guard);
            fsys.iput(ip);
            return Err(FsError::BadExecutable.into());
        }

        let loaded = (|| -> KernelResult<(PageTable, usize, usize)> {
            let elf: ElfHeader =
                read_struct(&mut guard, 0)?.ok_or(FsError::BadExecutable)?;
            if elf.magic != ELF_MAGIC {
                return Err(FsError::BadExecutable.into());
            }

            let pt = proc::create_user_pagetable(tf_frame)?;
            let frames = frame::allocator();
            let mut sz = 0usize;

            let build = (|| -> KernelResult<usize> {
                for i in 0..elf.phnum {
                    let ph_off = elf.phoff as u32 + i as u32 * core::mem::size_of::<ProgHeader>() as u32;
                    let ph: ProgHeader =
                        read_struct(&mut guard, ph_off)?.ok_or(FsError::BadExecutable)?;
                    if ph.typ != PT_LOAD {
                        continue;
                    }
                    if ph.memsz < ph.filesz
                        || ph.vaddr % PAGE_SIZE as u64 != 0
                        || ph.vaddr.checked_add(ph.memsz).is_none()
                    {
                        return Err(FsError::BadExecutable.into());
                    }
                    sz = uvm::alloc(
                        &pt,
                        frames,
                        sz,
                        (ph.vaddr + ph.memsz) as usize,
                        perm_from_flags(ph.flags),
                    )?;
                    load_segment(
                        &pt,
                        &mut guard,
                        ph.vaddr as usize,
                        ph.off as u32,
                        ph.filesz as usize,
                    )?;
                }
                Ok(sz)
            })();

            match build {
                Ok(sz) => Ok((pt, sz, elf.entry as usize)),
                Err(e) => {
                    proc::free_user_pagetable(pt, sz);
                    Err(e)
                }
            }
        })();
        drop(guard);
        fsys.iput(ip);

        let (pt, sz, entry) = loaded?;

        // One page of user stack at the top of the image.
        let frames = frame::allocator();
        let stack_base = page_round_up(sz);
        let sz = match uvm::alloc(&pt, frames, stack_base, stack_base + PAGE_SIZE, PteFlags::W) {
            Ok(s) => s,
            Err(e) => {
                proc::free_user_pagetable(pt, sz);
                return Err(e);
            }
        };
        let mut sp = sz;

        // Copy argument strings, then the argv array, onto the stack.
        let pushed = (|| -> KernelResult<(usize, usize)> {
            let mut argv = [0u64; MAXARG + 1];
            for (i, arg) in args.iter().enumerate() {
                sp -= arg.len() + 1;
                sp &= !0xf; // the ABI wants 16-byte stack alignment
                if sp < stack_base {
                    return Err(KernelError::InvalidArgument { name: "argv" });
                }
                uvm::copy_out(&pt, sp, arg)?;
                uvm::copy_out(&pt, sp + arg.len(), &[0])?;
                argv[i] = sp as u64;
            }
            argv[args.len()] = 0;

            let vec_bytes = (args.len() + 1) * 8;
            sp -= vec_bytes;
            sp &= !0xf;
            if sp < stack_base {
                return Err(KernelError::InvalidArgument { name: "argv" });
            }
            for (i, a) in argv[..=args.len()].iter().enumerate() {
                uvm::copy_out(&pt, sp + i * 8, &a.to_le_bytes())?;
            }
            Ok((sp, sz))
        })();

        match pushed {
            Ok((sp, sz)) => Ok((pt, sz, entry, sp, sp)),
            Err(e) => {
                proc::free_user_pagetable(pt, sz);
                Err(e)
            }
        }
    })();
    fsys.log.end_op(fsys)?;

    let (pt, sz, entry, sp, argv_va) = result?;

    // Commit: swap in the new image and discard the old one.
    push_off();
    // SAFETY: interrupts are off.
    let p = &mut unsafe { proc::table_mut() }.procs[idx];
    debug_assert_eq!(p.state, ProcState::Running);
    let old_pt = p.pagetable.replace(pt);
    let old_sz = core::mem::replace(&mut p.sz, sz);
    if let Some(name) = path.rsplit(|&b| b == b'/').next() {
        let n = name.len().min(super::NAME_LEN - 1);
        p.name = [0; super::NAME_LEN];
        p.name[..n].copy_from_slice(&name[..n]);
    }
    let tf = p.trapframe_mut();
    tf.epc = entry;
    tf.sp = sp;
    tf.a1 = argv_va;
    pop_off();

    if let Some(old) = old_pt {
        proc::free_user_pagetable(old, old_sz);
    }

    Ok(args.len())
}
