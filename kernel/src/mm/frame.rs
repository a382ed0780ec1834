//! Physical frame allocator.
//!
//! A LIFO free list threaded through the free frames: the first word of
//! each free frame holds the address of the next one. Initialization
//! walks the managed range page by page and frees each frame; allocation
//! pops the head and zeroes it; freeing fills the frame with a poison
//! byte (to trip use-after-free bugs early) before relinking it.

use crate::error::{KernelError, KernelResult};
use crate::mm::{PhysAddr, PAGE_SIZE};
use crate::sync::spinlock::SpinLock;

/// Byte written over freed frames.
const POISON: u8 = 0x01;

struct FreeList {
    /// Address of the first free frame; 0 when empty.
    head: usize,
    /// Managed range [start, end), page-aligned.
    start: usize,
    end: usize,
    /// Number of frames currently on the list.
    free_frames: usize,
}

/// Frame allocator over one contiguous physical range.
///
/// The kernel owns a single global instance covering `[end-of-image,
/// PHYSTOP)`; unit tests build private instances over heap arenas.
pub struct FrameAllocator {
    inner: SpinLock<FreeList>,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "frames",
                FreeList {
                    head: 0,
                    start: 0,
                    end: 0,
                    free_frames: 0,
                },
            ),
        }
    }

    /// Hand the range `[start, end)` to the allocator and free every
    /// fully contained, page-aligned frame in it.
    pub fn init(&self, start: usize, end: usize) {
        {
            let mut inner = self.inner.lock();
            inner.start = super::page_round_up(start);
            inner.end = super::page_round_down(end);
        }
        let (first, last) = {
            let inner = self.inner.lock();
            (inner.start, inner.end)
        };
        let mut pa = first;
        while pa + PAGE_SIZE <= last {
            self.free(PhysAddr::new(pa));
            pa += PAGE_SIZE;
        }
        log::info!(
            "frames: managing {:#x}..{:#x} ({} pages)",
            first,
            last,
            self.free_count()
        );
    }

    /// Allocate one zeroed frame.
    pub fn alloc(&self) -> KernelResult<PhysAddr> {
        let pa = {
            let mut inner = self.inner.lock();
            if inner.head == 0 {
                return Err(KernelError::OutOfMemory);
            }
            let pa = inner.head;
            // SAFETY: `head` was installed by free(), so it points at a
            // page-aligned frame inside the managed range whose first
            // word is the next-free link.
            inner.head = unsafe { *(pa as *const usize) };
            inner.free_frames -= 1;
            pa
        };
        // SAFETY: the frame was just unlinked, so this is the only
        // reference to it; it is PAGE_SIZE bytes of writable memory.
        unsafe {
            core::ptr::write_bytes(pa as *mut u8, 0, PAGE_SIZE);
        }
        Ok(PhysAddr::new(pa))
    }

    /// Return a frame to the free list.
    ///
    /// Misaligned or out-of-range addresses are fatal bugs: the caller
    /// handed back something the allocator never produced.
    pub fn free(&self, pa: PhysAddr) {
        let addr = pa.as_usize();
        let mut inner = self.inner.lock();
        if addr % PAGE_SIZE != 0 || addr < inner.start || addr >= inner.end {
            panic!("frame free: bad address {:#x}", addr);
        }
        // SAFETY: the address is page-aligned and inside the managed
        // range (checked above); the caller relinquishes the frame, so
        // poisoning and relinking it cannot alias live data.
        unsafe {
            core::ptr::write_bytes(addr as *mut u8, POISON, PAGE_SIZE);
            *(addr as *mut usize) = inner.head;
        }
        inner.head = addr;
        inner.free_frames += 1;
    }

    /// Number of frames currently free.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_frames
    }

    /// Does the managed range contain `pa`?
    pub fn contains(&self, pa: PhysAddr) -> bool {
        let inner = self.inner.lock();
        pa.as_usize() >= inner.start && pa.as_usize() < inner.end
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance.
static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

/// The kernel's frame allocator.
pub fn allocator() -> &'static FrameAllocator {
    &FRAME_ALLOCATOR
}

#[cfg(not(target_os = "none"))]
pub mod testing {
    //! Hosted test support: frame allocators over leaked heap arenas.

    use super::FrameAllocator;
    use crate::mm::PAGE_SIZE;

    /// Build an allocator managing `pages` frames of leaked heap memory.
    ///
    /// The arena leaks by design: frames become sleep channels and page
    /// table nodes whose addresses must stay valid for the test process
    /// lifetime.
    pub fn arena_allocator(pages: usize) -> FrameAllocator {
        let bytes = (pages + 1) * PAGE_SIZE;
        let arena = std::boxed::Box::leak(std::vec![0u8; bytes].into_boxed_slice());
        let start = arena.as_ptr() as usize;
        let alloc = FrameAllocator::new();
        alloc.init(start, start + bytes);
        alloc
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::testing::arena_allocator;
    use super::*;

    #[test]
    fn alloc_returns_zeroed_aligned_frames() {
        let alloc = arena_allocator(8);
        let pa = alloc.alloc().expect("arena has frames");
        assert!(pa.is_page_aligned());
        // SAFETY: pa is a live frame we own.
        let page = unsafe { core::slice::from_raw_parts(pa.as_ptr::<u8>(), PAGE_SIZE) };
        assert!(page.iter().all(|&b| b == 0), "allocation must zero");
        alloc.free(pa);
    }

    #[test]
    fn freed_frames_are_reused_lifo() {
        let alloc = arena_allocator(8);
        let a = alloc.alloc().expect("first alloc");
        alloc.free(a);
        let b = alloc.alloc().expect("realloc");
        assert_eq!(a, b, "free list is LIFO");
        alloc.free(b);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let alloc = arena_allocator(4);
        let total = alloc.free_count();
        let mut held = std::vec::Vec::new();
        while let Ok(pa) = alloc.alloc() {
            held.push(pa);
        }
        assert_eq!(held.len(), total);
        assert_eq!(
            alloc.alloc().unwrap_err(),
            KernelError::OutOfMemory,
            "exhaustion is an error, not a panic"
        );
        for pa in held {
            alloc.free(pa);
        }
        assert_eq!(alloc.free_count(), total);
    }

    #[test]
    #[should_panic(expected = "bad address")]
    fn misaligned_free_is_fatal() {
        let alloc = arena_allocator(4);
        let pa = alloc.alloc().expect("alloc");
        alloc.free(PhysAddr::new(pa.as_usize() + 1));
    }
}
