//! FerriteOS kernel entry point.
//!
//! The machine-mode bring-up stub (entry.S/start) lands here in
//! supervisor mode with paging off, running on the boot stack. Each
//! subsystem initializes bottom-up; the final act is handing the hart
//! to the scheduler, which never returns.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::panic::PanicInfo;
    use core::sync::atomic::Ordering;

    use ferrite_kernel::drivers::{console, uart, virtio};
    use ferrite_kernel::memlayout::{PHYSTOP, UART0_IRQ, VIRTIO0_IRQ};
    use ferrite_kernel::{arch, fs, logger, mm, proc, trap};

    extern "C" {
        /// End of the kernel image (provided by the linker script).
        static end: u8;
    }

    /// Supervisor-mode entry, called by the bring-up stub.
    #[no_mangle]
    pub extern "C" fn kmain() -> ! {
        console::init();
        logger::init();
        banner();

        // SAFETY: `end` is a linker symbol; its address is data.
        let ram_start = unsafe { &end as *const u8 as usize };
        mm::frame::allocator().init(ram_start, PHYSTOP);

        mm::kvm::init();
        mm::kvm::init_hart();

        proc::init();
        trap::init_hart();
        trap::timer::init_hart();
        arch::plic::init(arch::cpu_id());

        trap::register_irq(UART0_IRQ, uart::handle_interrupt);
        trap::register_irq(VIRTIO0_IRQ, virtio::blk::handle_interrupt);

        virtio::blk::init().expect("boot: no virtio block device");
        let disk = virtio::blk::device().expect("boot: block device vanished");
        fs::init(disk, mm::frame::allocator());

        proc::lifecycle::user_init();

        arch::enable_interrupt_sources();
        log::info!("boot: entering scheduler");
        proc::scheduler();
    }

    fn banner() {
        console::clear_screen();
        console::set_color(36); // cyan
        ferrite_kernel::println!("FerriteOS {}", env!("CARGO_PKG_VERSION"));
        console::reset_color();
    }

    /// Panic: flag the console so prints bypass their lock, dump the
    /// cause, silence interrupts, and park the hart.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        console::PANICKED.store(true, Ordering::Relaxed);
        ferrite_kernel::println!("\nKERNEL PANIC: {}", info);
        arch::intr_off();
        loop {
            arch::wait_for_interrupt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary only exists for the bare-metal target; the
    // hosted build is for `cargo test` against the library.
}
