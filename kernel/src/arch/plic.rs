//! Platform-level interrupt controller (SiFive PLIC, QEMU virt machine).
//!
//! The PLIC aggregates external interrupt sources and delivers them to
//! hart contexts by priority. Each hart has an M-mode context (even) and
//! an S-mode context (odd); this kernel only ever programs the S-mode
//! context of the boot hart.

use core::sync::atomic::{fence, Ordering};

use crate::memlayout::{PLIC, UART0_IRQ, VIRTIO0_IRQ};

/// Offset of the per-source priority register array.
const PRIORITY_OFFSET: usize = 0x0000;
/// Offset of the per-context enable bit arrays.
const ENABLE_OFFSET: usize = 0x2000;
/// Stride between per-context enable arrays.
const ENABLE_STRIDE: usize = 0x80;
/// Offset of the per-context threshold register.
const THRESHOLD_OFFSET: usize = 0x20_0000;
/// Offset of the per-context claim/complete register.
const CLAIM_OFFSET: usize = 0x20_0004;
/// Stride between per-context threshold/claim regions.
const CONTEXT_STRIDE: usize = 0x1000;

/// S-mode context number for a hart: `hart * 2 + 1`.
const fn s_context(hart: usize) -> usize {
    hart * 2 + 1
}

#[inline]
fn priority_addr(irq: u32) -> *mut u32 {
    (PLIC + PRIORITY_OFFSET + irq as usize * 4) as *mut u32
}

#[inline]
fn enable_addr(hart: usize, irq: u32) -> *mut u32 {
    (PLIC + ENABLE_OFFSET + s_context(hart) * ENABLE_STRIDE + (irq as usize / 32) * 4) as *mut u32
}

#[inline]
fn threshold_addr(hart: usize) -> *mut u32 {
    (PLIC + THRESHOLD_OFFSET + s_context(hart) * CONTEXT_STRIDE) as *mut u32
}

#[inline]
fn claim_addr(hart: usize) -> *mut u32 {
    (PLIC + CLAIM_OFFSET + s_context(hart) * CONTEXT_STRIDE) as *mut u32
}

/// Give the UART and block-device sources a non-zero priority, enable
/// them for the boot hart's S-mode context, and accept all priorities.
pub fn init(hart: usize) {
    // SAFETY: all addresses point into the PLIC MMIO region, which the
    // kernel page table identity-maps. write_volatile is required so the
    // compiler neither reorders nor elides device register writes.
    unsafe {
        core::ptr::write_volatile(priority_addr(UART0_IRQ), 1);
        core::ptr::write_volatile(priority_addr(VIRTIO0_IRQ), 1);

        let bits = (1u32 << (UART0_IRQ % 32)) | (1u32 << (VIRTIO0_IRQ % 32));
        core::ptr::write_volatile(enable_addr(hart, UART0_IRQ), bits);

        // Threshold 0: deliver every enabled source with priority >= 1.
        core::ptr::write_volatile(threshold_addr(hart), 0);
    }
    fence(Ordering::SeqCst);

    log::info!("plic: enabled uart irq {} and virtio irq {}", UART0_IRQ, VIRTIO0_IRQ);
}

/// Claim the highest-priority pending interrupt for this hart.
///
/// Returns `None` when the claim register reads zero (nothing pending).
/// Every `Some(irq)` must be matched with a [`complete`] call.
pub fn claim(hart: usize) -> Option<u32> {
    // SAFETY: reading the claim/complete register atomically claims the
    // highest-priority pending source; the address is a fixed MMIO
    // location for the boot hart's S-mode context.
    let irq = unsafe { core::ptr::read_volatile(claim_addr(hart)) };
    if irq == 0 {
        None
    } else {
        Some(irq)
    }
}

/// Signal end-of-interrupt for a source previously returned by [`claim`].
pub fn complete(hart: usize, irq: u32) {
    // SAFETY: writing the source number back to the claim/complete
    // register is the architectural EOI handshake.
    unsafe {
        core::ptr::write_volatile(claim_addr(hart), irq);
    }
    fence(Ordering::SeqCst);
}
