//! FerriteOS kernel library.
//!
//! A teaching-grade preemptive multiprogramming kernel for 64-bit
//! RISC-V (Sv39) on the QEMU virt machine: one hart, an NS16550 UART, a
//! virtio-mmio block device, and the SiFive PLIC.
//!
//! The crate is `no_std` on the bare-metal target. On hosted targets it
//! links against `std` so the subsystems with no hardware dependency --
//! the filesystem stack over a RAM disk, virtual memory over a heap
//! arena, locks, pipes, the console line discipline -- run under the
//! standard test harness.

#![no_std]

// Host target: unit tests and their RAM-backed test doubles use std.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod logger;
pub mod memlayout;
pub mod mm;
pub mod param;
pub mod proc;
pub mod sync;
pub mod syscall;
pub mod trap;

pub use error::{KernelError, KernelResult};
