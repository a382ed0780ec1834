//! Kernel address space.
//!
//! Built once at boot: identity mappings for the UART, virtio MMIO
//! window, PLIC, and CLINT; kernel text read-execute; kernel data and
//! the rest of RAM read-write; the trampoline page at the top of the
//! address space; and one kernel stack per process slot, each above an
//! unmapped guard page.

#[cfg(target_arch = "riscv64")]
mod imp {
    use spin::Once;

    use crate::memlayout::{
        kstack, CLINT, CLINT_SIZE, KERNBASE, PHYSTOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0, VIRTIO0,
    };
    use crate::mm::{frame, PageTable, PteFlags, PAGE_SIZE};
    use crate::param::NPROC;
    use crate::{arch, trap};

    extern "C" {
        /// End of kernel text (provided by the linker script).
        static etext: u8;
    }

    static KERNEL_PAGETABLE: Once<PageTable> = Once::new();

    /// Build the kernel page table.
    pub fn init() {
        let frames = frame::allocator();
        let pt = PageTable::new(frames).expect("kvm: out of memory for root table");

        let rw = PteFlags::R | PteFlags::W;
        let rx = PteFlags::R | PteFlags::X;
        // SAFETY: `etext` is a linker symbol marking the end of .text.
        let etext_addr = unsafe { &etext as *const u8 as usize };

        pt.map_range(UART0, UART0, PAGE_SIZE, rw, frames)
            .expect("kvm: uart map");
        pt.map_range(VIRTIO0, VIRTIO0, PAGE_SIZE, rw, frames)
            .expect("kvm: virtio map");
        pt.map_range(PLIC, PLIC, PLIC_SIZE, rw, frames)
            .expect("kvm: plic map");
        pt.map_range(CLINT, CLINT, CLINT_SIZE, rw, frames)
            .expect("kvm: clint map");
        pt.map_range(KERNBASE, KERNBASE, etext_addr - KERNBASE, rx, frames)
            .expect("kvm: text map");
        pt.map_range(etext_addr, etext_addr, PHYSTOP - etext_addr, rw, frames)
            .expect("kvm: data map");
        pt.map_range(
            TRAMPOLINE,
            trap::trampoline_addr(),
            PAGE_SIZE,
            rx,
            frames,
        )
        .expect("kvm: trampoline map");

        // One kernel stack per process slot, guard page below each.
        for i in 0..NPROC {
            let pa = frames.alloc().expect("kvm: out of memory for kstack");
            pt.map_range(kstack(i), pa.as_usize(), PAGE_SIZE, rw, frames)
                .expect("kvm: kstack map");
        }

        KERNEL_PAGETABLE.call_once(|| pt);
        log::info!("kvm: kernel page table built");
    }

    /// Switch this hart onto the kernel page table.
    pub fn init_hart() {
        let pt = kernel_pagetable();
        // SAFETY: the table was fully built by init() and identity-maps
        // the executing kernel text.
        unsafe {
            arch::write_satp(pt.satp());
        }
        log::info!("kvm: paging enabled");
    }

    /// The kernel page table (valid after [`init`]).
    pub fn kernel_pagetable() -> &'static PageTable {
        KERNEL_PAGETABLE
            .get()
            .expect("kvm: used before initialization")
    }

    /// satp token recorded into every trap frame.
    pub fn kernel_satp() -> usize {
        kernel_pagetable().satp()
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod imp {
    //! Hosted stub: there is no kernel address space to build.

    pub fn init() {}

    pub fn init_hart() {}

    pub fn kernel_satp() -> usize {
        0
    }
}

pub use imp::*;
