//! Sv39 page tables.
//!
//! A page table is a page-sized array of 512 entries; three levels map a
//! 39-bit virtual address (9+9+9 index bits + 12 offset bits). A valid
//! entry with any of R/W/X set is a leaf; a valid entry with none of them
//! points at a child table. The kernel identity mapping lets a table's
//! physical address be dereferenced directly.

use bitflags::bitflags;

use crate::error::KernelResult;
use crate::memlayout::MAXVA;
use crate::mm::{FrameAllocator, PhysAddr, PAGE_SIZE};

bitflags! {
    /// Page-table entry permission and status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        /// Entry is valid.
        const V = 1 << 0;
        /// Readable leaf.
        const R = 1 << 1;
        /// Writable leaf.
        const W = 1 << 2;
        /// Executable leaf.
        const X = 1 << 3;
        /// Accessible from user mode.
        const U = 1 << 4;
        /// Global mapping.
        const G = 1 << 5;
        /// Accessed (set by hardware).
        const A = 1 << 6;
        /// Dirty (set by hardware).
        const D = 1 << 7;
    }
}

/// One Sv39 page-table entry: PPN in bits 53..10, flags in bits 9..0.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(usize);

impl Pte {
    const FLAG_MASK: usize = 0x3ff;

    pub fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        Self(((pa.as_usize() >> 12) << 10) | flags.bits())
    }

    pub const fn invalid() -> Self {
        Self(0)
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// A valid entry carrying any of R/W/X maps a frame; one carrying
    /// none points at a child table.
    pub fn is_leaf(&self) -> bool {
        self.flags()
            .intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    pub fn pa(&self) -> PhysAddr {
        PhysAddr::new((self.0 >> 10) << 12)
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & Self::FLAG_MASK)
    }
}

/// Index of `va` at the given tree level (2 = root).
#[inline]
fn px(level: usize, va: usize) -> usize {
    (va >> (12 + 9 * level)) & 0x1ff
}

/// Handle to an Sv39 page-table tree, identified by its root frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTable {
    root: PhysAddr,
}

impl PageTable {
    /// Allocate an empty root table.
    pub fn new(frames: &FrameAllocator) -> KernelResult<Self> {
        let root = frames.alloc()?;
        Ok(Self { root })
    }

    pub const fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// satp value selecting this table in Sv39 mode.
    pub fn satp(&self) -> usize {
        const SATP_SV39: usize = 8 << 60;
        SATP_SV39 | (self.root.as_usize() >> 12)
    }

    /// Find the leaf entry for `va`, allocating interior tables on the
    /// way down when `alloc` is provided.
    ///
    /// Returns `Ok(None)` when an interior table is missing and
    /// allocation was not requested. A virtual address at or beyond
    /// `MAXVA` is a kernel bug and panics.
    fn walk(&self, va: usize, alloc: Option<&FrameAllocator>) -> KernelResult<Option<*mut Pte>> {
        if va >= MAXVA {
            panic!("walk: va {:#x} out of range", va);
        }
        let mut table = self.root;
        for level in [2, 1] {
            // SAFETY: `table` is the root frame or a child installed by a
            // previous map; either way it is a live page-table frame and
            // px() keeps the index under 512.
            let pte_ptr = unsafe { table.as_mut_ptr::<Pte>().add(px(level, va)) };
            // SAFETY: pte_ptr points into a live table frame.
            let pte = unsafe { *pte_ptr };
            if pte.is_valid() {
                table = pte.pa();
            } else {
                let frames = match alloc {
                    Some(f) => f,
                    None => return Ok(None),
                };
                let child = frames.alloc()?;
                // SAFETY: pte_ptr is a live entry slot; child is a fresh
                // zeroed frame that now becomes an interior table.
                unsafe {
                    *pte_ptr = Pte::new(child, PteFlags::V);
                }
                table = child;
            }
        }
        // SAFETY: `table` is the level-0 table for va.
        Ok(Some(unsafe { table.as_mut_ptr::<Pte>().add(px(0, va)) }))
    }

    /// Install a leaf mapping `va -> pa` with `perm | V`.
    ///
    /// Remapping an already valid leaf is a fatal bug.
    pub fn map(
        &self,
        va: usize,
        pa: PhysAddr,
        perm: PteFlags,
        frames: &FrameAllocator,
    ) -> KernelResult<()> {
        if va % PAGE_SIZE != 0 || !pa.is_page_aligned() {
            panic!("map: unaligned va {:#x} / pa {:#x}", va, pa.as_usize());
        }
        let pte_ptr = self
            .walk(va, Some(frames))?
            .expect("walk with alloc returns an entry");
        // SAFETY: pte_ptr came from walk() on this live table.
        unsafe {
            if (*pte_ptr).is_valid() {
                panic!("map: remap of va {:#x}", va);
            }
            *pte_ptr = Pte::new(pa, perm | PteFlags::V);
        }
        Ok(())
    }

    /// Map a byte range, page by page (addresses need not be aligned;
    /// the range is widened to page boundaries).
    pub fn map_range(
        &self,
        va: usize,
        pa: usize,
        size: usize,
        perm: PteFlags,
        frames: &FrameAllocator,
    ) -> KernelResult<()> {
        let mut a = super::page_round_down(va);
        let last = super::page_round_down(va + size - 1);
        let mut pa = super::page_round_down(pa);
        loop {
            self.map(a, PhysAddr::new(pa), perm, frames)?;
            if a == last {
                break;
            }
            a += PAGE_SIZE;
            pa += PAGE_SIZE;
        }
        Ok(())
    }

    /// Remove the leaf for `va`, optionally freeing the mapped frame.
    ///
    /// The mapping must exist and be a leaf; anything else is a fatal
    /// bug in the caller's bookkeeping.
    pub fn unmap(&self, va: usize, free_frame: bool, frames: &FrameAllocator) {
        if va % PAGE_SIZE != 0 {
            panic!("unmap: unaligned va {:#x}", va);
        }
        let pte_ptr = match self.walk(va, None) {
            Ok(Some(p)) => p,
            _ => panic!("unmap: va {:#x} not mapped", va),
        };
        // SAFETY: pte_ptr came from walk() on this live table.
        unsafe {
            let pte = *pte_ptr;
            if !pte.is_valid() {
                panic!("unmap: va {:#x} not mapped", va);
            }
            if !pte.is_leaf() {
                panic!("unmap: va {:#x} is not a leaf", va);
            }
            if free_frame {
                frames.free(pte.pa());
            }
            *pte_ptr = Pte::invalid();
        }
    }

    /// Remove `npages` consecutive leaves starting at `va`.
    pub fn unmap_range(
        &self,
        va: usize,
        npages: usize,
        free_frames: bool,
        frames: &FrameAllocator,
    ) {
        for i in 0..npages {
            self.unmap(va + i * PAGE_SIZE, free_frames, frames);
        }
    }

    /// Look up an existing leaf mapping without allocating.
    pub fn translate(&self, va: usize) -> Option<(PhysAddr, PteFlags)> {
        if va >= MAXVA {
            return None;
        }
        let pte_ptr = self.walk(va, None).ok()??;
        // SAFETY: pte_ptr came from walk() on this live table.
        let pte = unsafe { *pte_ptr };
        if !pte.is_valid() || !pte.is_leaf() {
            return None;
        }
        Some((pte.pa(), pte.flags()))
    }

    /// Free the whole tree: interior nodes bottom-up, then the root.
    ///
    /// Every leaf must already be unmapped; a surviving leaf means some
    /// frame would leak or be freed twice, so it panics.
    pub fn free(self, frames: &FrameAllocator) {
        Self::free_walk(self.root, frames);
    }

    fn free_walk(table: PhysAddr, frames: &FrameAllocator) {
        for i in 0..512 {
            // SAFETY: `table` is a live page-table frame and i < 512.
            let pte = unsafe { *table.as_ptr::<Pte>().add(i) };
            if pte.is_valid() {
                if pte.is_leaf() {
                    panic!("pagetable free: leaf still mapped");
                }
                Self::free_walk(pte.pa(), frames);
            }
        }
        frames.free(table);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::testing::arena_allocator;

    #[test]
    fn map_translate_unmap() {
        let frames = arena_allocator(16);
        let pt = PageTable::new(&frames).expect("root alloc");
        let frame = frames.alloc().expect("data frame");

        pt.map(0x4000, frame, PteFlags::R | PteFlags::W, &frames)
            .expect("map should succeed");

        let (pa, flags) = pt.translate(0x4000).expect("mapping exists");
        assert_eq!(pa, frame);
        assert!(flags.contains(PteFlags::V | PteFlags::R | PteFlags::W));
        assert!(!flags.contains(PteFlags::U));

        assert!(
            pt.translate(0x5000).is_none(),
            "unmapped va translates to none"
        );

        pt.unmap(0x4000, true, &frames);
        assert!(pt.translate(0x4000).is_none());
        pt.free(&frames);
    }

    #[test]
    fn interior_nodes_allocated_on_demand() {
        let frames = arena_allocator(16);
        let before = frames.free_count();
        let pt = PageTable::new(&frames).expect("root alloc");
        let frame = frames.alloc().expect("data frame");
        // A high address forces two fresh interior nodes.
        pt.map(0x3F_F000_0000, frame, PteFlags::R, &frames)
            .expect("map");
        assert_eq!(before - frames.free_count(), 4, "root + 2 interior + data");
        pt.unmap(0x3F_F000_0000, true, &frames);
        pt.free(&frames);
        assert_eq!(frames.free_count(), before, "teardown returns every frame");
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_is_fatal() {
        let frames = arena_allocator(16);
        let pt = PageTable::new(&frames).expect("root alloc");
        let frame = frames.alloc().expect("data frame");
        pt.map(0, frame, PteFlags::R, &frames).expect("first map");
        let _ = pt.map(0, frame, PteFlags::R, &frames);
    }

    #[test]
    #[should_panic(expected = "leaf still mapped")]
    fn freeing_mapped_table_is_fatal() {
        let frames = arena_allocator(16);
        let pt = PageTable::new(&frames).expect("root alloc");
        let frame = frames.alloc().expect("data frame");
        pt.map(0, frame, PteFlags::R, &frames).expect("map");
        pt.free(&frames);
    }

    #[test]
    fn satp_encodes_mode_and_root() {
        let frames = arena_allocator(4);
        let pt = PageTable::new(&frames).expect("root alloc");
        let satp = pt.satp();
        assert_eq!(satp >> 60, 8, "Sv39 mode");
        assert_eq!(
            (satp & ((1usize << 44) - 1)) << 12,
            pt.root().as_usize(),
            "PPN field holds the root frame"
        );
        pt.free(&frames);
    }
}
