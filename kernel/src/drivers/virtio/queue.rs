//! Split virtqueue: descriptor table, available ring, used ring.
//!
//! The driver hands the device chains of descriptors; the available ring
//! publishes chain heads, and the device reports completions through the
//! used ring. Each of the three structures lives in its own frame so its
//! physical address can be programmed into the transport registers
//! directly.

use core::sync::atomic::{fence, Ordering};

use crate::error::KernelResult;
use crate::mm::{FrameAllocator, PhysAddr};

/// Ring size: eight descriptors. The device must support at least this
/// many (checked against QUEUE_NUM_MAX during init).
pub const QUEUE_SIZE: usize = 8;

/// Descriptor flag: the chain continues at `next`.
pub const DESC_F_NEXT: u16 = 1;
/// Descriptor flag: the buffer is device-writable.
pub const DESC_F_WRITE: u16 = 2;

/// Descriptor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    /// Physical address of the buffer.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// DESC_F_NEXT / DESC_F_WRITE.
    pub flags: u16,
    /// Next descriptor in the chain, valid when NEXT is set.
    pub next: u16,
}

/// Available ring: driver publishes chain heads for the device.
#[repr(C)]
pub struct VirtqAvail {
    pub flags: u16,
    /// Next slot the driver will fill (free-running).
    pub idx: u16,
    pub ring: [u16; QUEUE_SIZE],
}

/// One completion record in the used ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    /// Head descriptor index of the completed chain.
    pub id: u32,
    /// Bytes the device wrote into the chain.
    pub len: u32,
}

/// Used ring: device reports completed chains.
#[repr(C)]
pub struct VirtqUsed {
    pub flags: u16,
    /// Next slot the device will fill (free-running).
    pub idx: u16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE],
}

/// A split virtqueue with driver-side descriptor bookkeeping.
pub struct VirtQueue {
    desc: PhysAddr,
    avail: PhysAddr,
    used: PhysAddr,
    /// Which descriptors are free.
    free: [bool; QUEUE_SIZE],
    /// Used-ring index the driver has consumed up to.
    last_used_idx: u16,
}

impl VirtQueue {
    /// Allocate the three rings, one zeroed frame each.
    pub fn new(frames: &FrameAllocator) -> KernelResult<Self> {
        let desc = frames.alloc()?;
        let avail = match frames.alloc() {
            Ok(pa) => pa,
            Err(e) => {
                frames.free(desc);
                return Err(e);
            }
        };
        let used = match frames.alloc() {
            Ok(pa) => pa,
            Err(e) => {
                frames.free(desc);
                frames.free(avail);
                return Err(e);
            }
        };
        Ok(Self {
            desc,
            avail,
            used,
            free: [true; QUEUE_SIZE],
            last_used_idx: 0,
        })
    }

    /// Physical addresses for the transport's DESC/DRIVER/DEVICE registers.
    pub fn phys_desc(&self) -> u64 {
        self.desc.as_usize() as u64
    }

    pub fn phys_avail(&self) -> u64 {
        self.avail.as_usize() as u64
    }

    pub fn phys_used(&self) -> u64 {
        self.used.as_usize() as u64
    }

    fn desc_ptr(&self, idx: u16) -> *mut VirtqDesc {
        debug_assert!((idx as usize) < QUEUE_SIZE);
        // SAFETY: desc is a live frame holding QUEUE_SIZE descriptors.
        unsafe { self.desc.as_mut_ptr::<VirtqDesc>().add(idx as usize) }
    }

    /// Claim one free descriptor.
    pub fn alloc_desc(&mut self) -> Option<u16> {
        for (i, free) in self.free.iter_mut().enumerate() {
            if *free {
                *free = false;
                return Some(i as u16);
            }
        }
        None
    }

    /// Claim three descriptors for a request chain, all or nothing.
    pub fn alloc_chain3(&mut self) -> Option<[u16; 3]> {
        let mut got = [0u16; 3];
        for slot in 0..3 {
            match self.alloc_desc() {
                Some(idx) => got[slot] = idx,
                None => {
                    for &idx in &got[..slot] {
                        self.free_desc(idx);
                    }
                    return None;
                }
            }
        }
        Some(got)
    }

    /// Return one descriptor to the free set.
    pub fn free_desc(&mut self, idx: u16) {
        let i = idx as usize;
        assert!(i < QUEUE_SIZE, "virtqueue: descriptor index out of range");
        assert!(!self.free[i], "virtqueue: double free of descriptor");
        self.free[i] = true;
        // SAFETY: the descriptor is ours again; clearing it keeps stale
        // addresses out of the table.
        unsafe {
            *self.desc_ptr(idx) = VirtqDesc::default();
        }
    }

    /// Free a whole chain linked through NEXT flags.
    pub fn free_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            // SAFETY: idx stays within the table; free_desc asserts it.
            let (flags, next) = unsafe {
                let d = &*self.desc_ptr(idx);
                (d.flags, d.next)
            };
            self.free_desc(idx);
            if flags & DESC_F_NEXT == 0 {
                break;
            }
            idx = next;
        }
    }

    /// Fill in a descriptor.
    ///
    /// # Safety
    ///
    /// `addr` must point at `len` bytes of physically contiguous memory
    /// that stays valid until the device returns the chain through the
    /// used ring.
    pub unsafe fn write_desc(&mut self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        // SAFETY: desc_ptr bounds-checks idx; the caller vouches for the
        // buffer behind addr.
        unsafe {
            *self.desc_ptr(idx) = VirtqDesc {
                addr,
                len,
                flags,
                next,
            };
        }
    }

    /// Publish a chain head in the available ring.
    ///
    /// Fences order the descriptor writes before the index update the
    /// device polls.
    pub fn push_avail(&mut self, head: u16) {
        // SAFETY: avail is a live frame holding a VirtqAvail.
        unsafe {
            let avail = &mut *self.avail.as_mut_ptr::<VirtqAvail>();
            let slot = avail.idx as usize % QUEUE_SIZE;
            avail.ring[slot] = head;
            fence(Ordering::SeqCst);
            avail.idx = avail.idx.wrapping_add(1);
            fence(Ordering::SeqCst);
        }
    }

    /// Pop one completion from the used ring, if the device has produced
    /// any the driver has not consumed yet.
    pub fn pop_used(&mut self) -> Option<VirtqUsedElem> {
        fence(Ordering::SeqCst);
        // SAFETY: used is a live frame holding a VirtqUsed; the device
        // only appends, so reading idx then the slot is safe.
        unsafe {
            let used = &*self.used.as_ptr::<VirtqUsed>();
            let device_idx = core::ptr::read_volatile(&used.idx);
            if self.last_used_idx == device_idx {
                return None;
            }
            let slot = self.last_used_idx as usize % QUEUE_SIZE;
            let elem = core::ptr::read_volatile(&used.ring[slot]);
            self.last_used_idx = self.last_used_idx.wrapping_add(1);
            Some(elem)
        }
    }

    /// Has the device produced completions the driver has not seen?
    pub fn has_used(&self) -> bool {
        fence(Ordering::SeqCst);
        // SAFETY: as in pop_used.
        let device_idx = unsafe { core::ptr::read_volatile(&(*self.used.as_ptr::<VirtqUsed>()).idx) };
        self.last_used_idx != device_idx
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::testing::arena_allocator;

    #[test]
    fn chain_allocation_is_all_or_nothing() {
        let frames = arena_allocator(8);
        let mut q = VirtQueue::new(&frames).expect("queue alloc");

        let a = q.alloc_chain3().expect("8 free -> first chain fits");
        let b = q.alloc_chain3().expect("5 free -> second chain fits");
        assert!(
            q.alloc_chain3().is_none(),
            "2 free descriptors cannot hold a chain of 3"
        );
        // The failed attempt must not leak descriptors.
        assert_eq!(q.free.iter().filter(|f| **f).count(), 2);

        for &d in a.iter().chain(b.iter()) {
            q.free_desc(d);
        }
        assert_eq!(q.free.iter().filter(|f| **f).count(), QUEUE_SIZE);
    }

    #[test]
    fn free_chain_follows_next_links() {
        let frames = arena_allocator(8);
        let mut q = VirtQueue::new(&frames).expect("queue alloc");
        let [d0, d1, d2] = q.alloc_chain3().expect("chain");
        // SAFETY: dummy addresses; the device never sees this queue.
        unsafe {
            q.write_desc(d0, 0x1000, 16, DESC_F_NEXT, d1);
            q.write_desc(d1, 0x2000, 512, DESC_F_NEXT, d2);
            q.write_desc(d2, 0x3000, 1, DESC_F_WRITE, 0);
        }
        q.free_chain(d0);
        assert_eq!(q.free.iter().filter(|f| **f).count(), QUEUE_SIZE);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let frames = arena_allocator(8);
        let mut q = VirtQueue::new(&frames).expect("queue alloc");
        let d = q.alloc_desc().expect("desc");
        q.free_desc(d);
        q.free_desc(d);
    }

    #[test]
    fn used_ring_consumption_tracks_device_index() {
        let frames = arena_allocator(8);
        let mut q = VirtQueue::new(&frames).expect("queue alloc");
        assert!(!q.has_used());
        assert!(q.pop_used().is_none());

        // Simulate the device completing chain 3.
        // SAFETY: the used frame is ours; no real device is attached.
        unsafe {
            let used = &mut *(q.phys_used() as *mut VirtqUsed);
            used.ring[0] = VirtqUsedElem { id: 3, len: 512 };
            used.idx = 1;
        }
        assert!(q.has_used());
        let elem = q.pop_used().expect("one completion");
        assert_eq!(elem.id, 3);
        assert!(q.pop_used().is_none(), "completion consumed exactly once");
    }
}
