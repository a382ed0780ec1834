//! User address spaces: growth, duplication, and checked cross-space
//! copies.
//!
//! Every transfer between kernel and user memory goes through
//! [`copy_in`] / [`copy_out`] / [`copy_in_str`], which walk the user page
//! table one page at a time and refuse addresses that are unmapped, not
//! user-accessible, or (for writes) not writable. Nothing in the kernel
//! ever dereferences a user virtual address directly.

use crate::error::{KernelError, KernelResult};
use crate::mm::{
    page_round_down, page_round_up, FrameAllocator, PageTable, PhysAddr, PteFlags, PAGE_SIZE,
};

/// Translate a user virtual address for the given access, returning the
/// physical address of its page.
fn user_page(pt: &PageTable, va: usize, write: bool) -> KernelResult<PhysAddr> {
    let (pa, flags) = pt
        .translate(page_round_down(va))
        .ok_or(KernelError::BadAddress { addr: va })?;
    if !flags.contains(PteFlags::U) {
        return Err(KernelError::BadAddress { addr: va });
    }
    if write && !flags.contains(PteFlags::W) {
        return Err(KernelError::BadAddress { addr: va });
    }
    Ok(pa)
}

/// Copy `src` into user memory at `dst_va`.
pub fn copy_out(pt: &PageTable, dst_va: usize, src: &[u8]) -> KernelResult<()> {
    let mut va = dst_va;
    let mut copied = 0;
    while copied < src.len() {
        let page = user_page(pt, va, true)?;
        let offset = va % PAGE_SIZE;
        let n = (PAGE_SIZE - offset).min(src.len() - copied);
        // SAFETY: `page` is a live user frame (the leaf was valid and
        // user-writable) and offset + n <= PAGE_SIZE.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                page.as_mut_ptr::<u8>().add(offset),
                n,
            );
        }
        copied += n;
        va += n;
    }
    Ok(())
}

/// Copy user memory at `src_va` into `dst`.
pub fn copy_in(pt: &PageTable, dst: &mut [u8], src_va: usize) -> KernelResult<()> {
    let mut va = src_va;
    let mut copied = 0;
    while copied < dst.len() {
        let page = user_page(pt, va, false)?;
        let offset = va % PAGE_SIZE;
        let n = (PAGE_SIZE - offset).min(dst.len() - copied);
        // SAFETY: `page` is a live user frame and offset + n <= PAGE_SIZE.
        unsafe {
            core::ptr::copy_nonoverlapping(
                page.as_ptr::<u8>().add(offset),
                dst.as_mut_ptr().add(copied),
                n,
            );
        }
        copied += n;
        va += n;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user memory into `dst`.
///
/// Returns the string length (without the NUL). Fails if `dst` fills up
/// before a NUL is found.
pub fn copy_in_str(pt: &PageTable, dst: &mut [u8], src_va: usize) -> KernelResult<usize> {
    let mut va = src_va;
    let mut copied = 0;
    loop {
        let page = user_page(pt, va, false)?;
        let offset = va % PAGE_SIZE;
        let in_page = PAGE_SIZE - offset;
        for i in 0..in_page {
            if copied >= dst.len() {
                return Err(KernelError::InvalidArgument { name: "string" });
            }
            // SAFETY: offset + i < PAGE_SIZE within a live user frame.
            let byte = unsafe { *page.as_ptr::<u8>().add(offset + i) };
            if byte == 0 {
                dst[copied] = 0;
                return Ok(copied);
            }
            dst[copied] = byte;
            copied += 1;
        }
        va += in_page;
    }
}

/// Grow a user address space from `old_size` to `new_size` bytes,
/// allocating zeroed frames mapped `U | R | perm`.
///
/// On failure every page this call added is rolled back and the address
/// space is exactly as before.
pub fn alloc(
    pt: &PageTable,
    frames: &FrameAllocator,
    old_size: usize,
    new_size: usize,
    perm: PteFlags,
) -> KernelResult<usize> {
    if new_size <= old_size {
        return Ok(old_size);
    }
    let mut va = page_round_up(old_size);
    while va < new_size {
        let frame = match frames.alloc() {
            Ok(f) => f,
            Err(e) => {
                dealloc(pt, frames, va, old_size);
                return Err(e);
            }
        };
        if let Err(e) = pt.map(va, frame, PteFlags::U | PteFlags::R | perm, frames) {
            frames.free(frame);
            dealloc(pt, frames, va, old_size);
            return Err(e);
        }
        va += PAGE_SIZE;
    }
    Ok(new_size)
}

/// Shrink a user address space from `old_size` to `new_size` bytes,
/// unmapping and freeing whole pages. Returns the new size.
pub fn dealloc(
    pt: &PageTable,
    frames: &FrameAllocator,
    old_size: usize,
    new_size: usize,
) -> usize {
    if new_size >= old_size {
        return old_size;
    }
    let first = page_round_up(new_size);
    let last = page_round_up(old_size);
    if first < last {
        pt.unmap_range(first, (last - first) / PAGE_SIZE, true, frames);
    }
    new_size
}

/// Duplicate every mapping in `[0, size)` from `src` into `dst`,
/// copying page contents and preserving permission bits.
///
/// On failure `dst` is stripped of everything this call added. A missing
/// page below `size` means the caller's size bookkeeping is broken and
/// panics.
pub fn copy(
    src: &PageTable,
    dst: &PageTable,
    frames: &FrameAllocator,
    size: usize,
) -> KernelResult<()> {
    let mut va = 0;
    while va < size {
        let (src_pa, flags) = src
            .translate(va)
            .unwrap_or_else(|| panic!("uvm copy: va {:#x} not mapped", va));
        let frame = match frames.alloc() {
            Ok(f) => f,
            Err(e) => {
                dealloc(dst, frames, va, 0);
                return Err(e);
            }
        };
        // SAFETY: both frames are live whole pages; source is mapped in
        // `src`, destination was just allocated.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src_pa.as_ptr::<u8>(),
                frame.as_mut_ptr::<u8>(),
                PAGE_SIZE,
            );
        }
        if let Err(e) = dst.map(va, frame, flags, frames) {
            frames.free(frame);
            dealloc(dst, frames, va, 0);
            return Err(e);
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Tear down a user address space: free `size` bytes of mappings, then
/// the table tree itself.
///
/// The caller must already have removed any non-user mappings it added
/// (trampoline, trap frame), since [`PageTable::free`] refuses leaves.
pub fn free(pt: PageTable, frames: &FrameAllocator, size: usize) {
    if size > 0 {
        pt.unmap_range(0, page_round_up(size) / PAGE_SIZE, true, frames);
    }
    pt.free(frames);
}

/// Install `code` in a fresh page mapped at virtual address 0.
///
/// Used once, to plant the built-in first user program.
pub fn first_page(
    pt: &PageTable,
    frames: &FrameAllocator,
    code: &[u8],
    perm: PteFlags,
) -> KernelResult<()> {
    if code.len() > PAGE_SIZE {
        return Err(KernelError::InvalidArgument { name: "init code" });
    }
    let frame = frames.alloc()?;
    // SAFETY: `frame` is a fresh zeroed page, code fits (checked above).
    unsafe {
        core::ptr::copy_nonoverlapping(code.as_ptr(), frame.as_mut_ptr::<u8>(), code.len());
    }
    pt.map(0, frame, PteFlags::U | perm, frames)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::testing::arena_allocator;

    fn fresh_space(frames: &FrameAllocator, size: usize) -> PageTable {
        let pt = PageTable::new(frames).expect("root alloc");
        alloc(&pt, frames, 0, size, PteFlags::W).expect("grow");
        pt
    }

    #[test]
    fn copy_out_then_in_round_trips() {
        let frames = arena_allocator(64);
        let pt = fresh_space(&frames, 3 * PAGE_SIZE);

        // Straddle a page boundary on purpose.
        let msg = b"crossing the page boundary here";
        let va = PAGE_SIZE - 7;
        copy_out(&pt, va, msg).expect("copy_out");

        let mut back = [0u8; 31];
        copy_in(&pt, &mut back, va).expect("copy_in");
        assert_eq!(&back, msg);

        free(pt, &frames, 3 * PAGE_SIZE);
    }

    #[test]
    fn copies_reject_unmapped_and_kernel_only_pages() {
        let frames = arena_allocator(64);
        let pt = fresh_space(&frames, PAGE_SIZE);

        let mut buf = [0u8; 4];
        assert!(
            copy_in(&pt, &mut buf, 5 * PAGE_SIZE).is_err(),
            "read beyond the mapped region must fail"
        );

        // A page without the U bit is invisible to user copies.
        let secret = frames.alloc().expect("frame");
        pt.map(8 * PAGE_SIZE, secret, PteFlags::R | PteFlags::W, &frames)
            .expect("map");
        assert!(copy_in(&pt, &mut buf, 8 * PAGE_SIZE).is_err());
        assert!(copy_out(&pt, 8 * PAGE_SIZE, &buf).is_err());

        pt.unmap(8 * PAGE_SIZE, true, &frames);
        free(pt, &frames, PAGE_SIZE);
    }

    #[test]
    fn copy_out_requires_writable() {
        let frames = arena_allocator(64);
        let pt = PageTable::new(&frames).expect("root");
        let frame = frames.alloc().expect("frame");
        pt.map(0, frame, PteFlags::U | PteFlags::R, &frames)
            .expect("map read-only");
        assert!(copy_out(&pt, 0, b"x").is_err(), "read-only page rejects writes");
        let mut b = [0u8; 1];
        copy_in(&pt, &mut b, 0).expect("reads are fine");
        pt.unmap(0, true, &frames);
        pt.free(&frames);
    }

    #[test]
    fn copy_in_str_stops_at_nul_and_reports_overflow() {
        let frames = arena_allocator(64);
        let pt = fresh_space(&frames, PAGE_SIZE);

        copy_out(&pt, 16, b"hello\0trailing").expect("plant string");
        let mut buf = [0u8; 32];
        let len = copy_in_str(&pt, &mut buf, 16).expect("copy_in_str");
        assert_eq!(len, 5);
        assert_eq!(&buf[..6], b"hello\0");

        let mut tiny = [0u8; 3];
        assert!(
            copy_in_str(&pt, &mut tiny, 16).is_err(),
            "no NUL within max is an error"
        );

        free(pt, &frames, PAGE_SIZE);
    }

    #[test]
    fn alloc_rounds_to_pages_and_dealloc_returns_frames() {
        let frames = arena_allocator(64);
        let before = frames.free_count();
        let pt = PageTable::new(&frames).expect("root");

        // Growing by 1 byte past a boundary costs exactly one frame.
        let sz = alloc(&pt, &frames, 0, 1, PteFlags::W).expect("grow");
        assert_eq!(sz, 1);
        let sz = alloc(&pt, &frames, sz, PAGE_SIZE + 1, PteFlags::W).expect("grow");
        assert_eq!(sz, PAGE_SIZE + 1);

        let sz = dealloc(&pt, &frames, sz, 0);
        assert_eq!(sz, 0);
        pt.free(&frames);
        assert_eq!(frames.free_count(), before);
    }

    #[test]
    fn failed_alloc_rolls_back() {
        let frames = arena_allocator(8);
        let pt = PageTable::new(&frames).expect("root");
        let sz = alloc(&pt, &frames, 0, PAGE_SIZE, PteFlags::W).expect("small grow");
        let live_after_grow = frames.free_count();

        // Far more than the arena holds.
        let err = alloc(&pt, &frames, sz, 64 * PAGE_SIZE, PteFlags::W);
        assert_eq!(err.unwrap_err(), KernelError::OutOfMemory);
        assert_eq!(
            frames.free_count(),
            live_after_grow,
            "partial growth must be rolled back"
        );

        free(pt, &frames, sz);
    }

    #[test]
    fn duplicated_space_matches_source_byte_for_byte() {
        let frames = arena_allocator(64);
        let size = 2 * PAGE_SIZE;
        let src = fresh_space(&frames, size);
        for i in 0..size / 8 {
            let word = (i as u64).to_le_bytes();
            copy_out(&src, i * 8, &word).expect("fill");
        }

        let dst = PageTable::new(&frames).expect("root");
        copy(&src, &dst, &frames, size).expect("uvm copy");

        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        for va in (0..size).step_by(8) {
            copy_in(&src, &mut a, va).expect("src read");
            copy_in(&dst, &mut b, va).expect("dst read");
            assert_eq!(a, b, "mismatch at va {:#x}", va);
        }

        free(src, &frames, size);
        free(dst, &frames, size);
    }
}
