//! Physical frame allocator
//!
//! Owns page-granular physical RAM. Every frame carries a reference count so
//! copy-on-write sharing works: 0 = free, 1 = exclusively owned, >1 = shared.
//! The allocator's own tables (free bitmap + refcount array) are carved out
//! of the first usable region at init and stay permanently in use, as do all
//! frames the boot map reports as non-usable.

use spin::Mutex;

use crate::{
    boot::BootInfo,
    error::{KernelError, KernelResult},
    mm::{PhysMapper, PhysicalAddress, PAGE_SHIFT, PAGE_SIZE},
};

/// Frame table state, guarded by the allocator's mutex.
struct FrameTable {
    /// Free bitmap, 1 = free. Lives in carved boot memory.
    bitmap: *mut u64,
    bitmap_words: usize,
    /// Per-frame reference counts, same span as the bitmap.
    refcounts: *mut u32,
    /// First frame number covered by the tables.
    base_frame: u64,
    /// Number of frames covered.
    frame_count: usize,
    /// Current number of free frames.
    free_frames: usize,
    /// Scan hint: word index where the last allocation succeeded.
    next_hint: usize,
}

impl FrameTable {
    fn index_of(&self, paddr: PhysicalAddress) -> Option<usize> {
        if !paddr.is_valid() || !paddr.is_page_aligned() {
            return None;
        }
        let frame = paddr.frame_number();
        if frame < self.base_frame {
            return None;
        }
        let idx = (frame - self.base_frame) as usize;
        if idx >= self.frame_count {
            return None;
        }
        Some(idx)
    }

    fn paddr_of(&self, idx: usize) -> PhysicalAddress {
        PhysicalAddress::new((self.base_frame + idx as u64) << PAGE_SHIFT)
    }

    fn bit_is_free(&self, idx: usize) -> bool {
        // SAFETY: idx < frame_count, and the bitmap covers frame_count bits.
        unsafe { *self.bitmap.add(idx / 64) & (1 << (idx % 64)) != 0 }
    }

    fn set_free(&mut self, idx: usize, free: bool) {
        // SAFETY: idx < frame_count, and the bitmap covers frame_count bits.
        unsafe {
            let word = self.bitmap.add(idx / 64);
            if free {
                *word |= 1 << (idx % 64);
            } else {
                *word &= !(1 << (idx % 64));
            }
        }
    }

    fn rc(&self, idx: usize) -> u32 {
        // SAFETY: idx < frame_count, and the refcount array covers it.
        unsafe { *self.refcounts.add(idx) }
    }

    fn set_rc(&mut self, idx: usize, count: u32) {
        // SAFETY: idx < frame_count, and the refcount array covers it.
        unsafe { *self.refcounts.add(idx) = count }
    }

    fn alloc(&mut self) -> Option<usize> {
        if self.free_frames == 0 {
            return None;
        }
        for step in 0..self.bitmap_words {
            let word_idx = (self.next_hint + step) % self.bitmap_words;
            // SAFETY: word_idx < bitmap_words.
            let word = unsafe { *self.bitmap.add(word_idx) };
            if word == 0 {
                continue;
            }
            let bit = word.trailing_zeros() as usize;
            let idx = word_idx * 64 + bit;
            if idx >= self.frame_count {
                continue;
            }
            self.set_free(idx, false);
            self.set_rc(idx, 1);
            self.free_frames -= 1;
            self.next_hint = word_idx;
            return Some(idx);
        }
        None
    }
}

/// Reference-counting physical frame allocator.
pub struct FrameAllocator {
    mapper: PhysMapper,
    inner: Mutex<FrameTable>,
}

// SAFETY: the raw table pointers reference carved boot memory that only this
// allocator touches, and every access goes through the mutex.
unsafe impl Send for FrameAllocator {}
unsafe impl Sync for FrameAllocator {}

impl FrameAllocator {
    /// Build the allocator from the boot memory map.
    ///
    /// Usable regions become the free pool; everything else in the covered
    /// span stays permanently in use, including the frames carved here for
    /// the bitmap and refcount array.
    pub fn new(boot: &BootInfo, mapper: PhysMapper) -> KernelResult<Self> {
        let mut span_start = u64::MAX;
        let mut span_end = 0u64;
        for region in boot.usable_regions() {
            span_start = span_start.min(region.base.as_u64());
            span_end = span_end.max(region.end());
        }
        if span_start >= span_end {
            return Err(KernelError::NoMemory {
                what: "no usable memory regions",
            });
        }

        let base_frame = span_start >> PAGE_SHIFT;
        let frame_count = ((span_end - span_start) as usize).div_ceil(PAGE_SIZE);
        let bitmap_words = frame_count.div_ceil(64);
        let table_bytes = bitmap_words * 8 + frame_count * 4;
        let table_pages = table_bytes.div_ceil(PAGE_SIZE);

        // Carve the tables from the first usable region that can hold them.
        let table_base = boot
            .usable_regions()
            .find(|r| r.length as usize >= table_pages * PAGE_SIZE)
            .map(|r| r.base)
            .ok_or(KernelError::NoMemory {
                what: "no region large enough for the frame table",
            })?;

        let bitmap = mapper.translate(table_base) as *mut u64;
        // SAFETY: the carved range is inside the linear window and unused;
        // the refcount array starts right after the bitmap words.
        let refcounts = unsafe { bitmap.add(bitmap_words) as *mut u32 };
        unsafe {
            core::ptr::write_bytes(bitmap, 0, bitmap_words);
            core::ptr::write_bytes(refcounts, 0, frame_count);
        }

        let mut table = FrameTable {
            bitmap,
            bitmap_words,
            refcounts,
            base_frame,
            frame_count,
            free_frames: 0,
            next_hint: 0,
        };

        // Everything starts in-use; open up the usable regions.
        for idx in 0..frame_count {
            table.set_rc(idx, 1);
        }
        for region in boot.usable_regions() {
            let first = region.base.as_u64() >> PAGE_SHIFT;
            let count = (region.length as usize) / PAGE_SIZE;
            for frame in first..first + count as u64 {
                let idx = (frame - base_frame) as usize;
                table.set_free(idx, true);
                table.set_rc(idx, 0);
                table.free_frames += 1;
            }
        }
        // Re-reserve the frames now holding the tables themselves.
        let first_table_frame = (table_base.as_u64() >> PAGE_SHIFT) - base_frame;
        for idx in first_table_frame as usize..first_table_frame as usize + table_pages {
            if table.bit_is_free(idx) {
                table.set_free(idx, false);
                table.free_frames -= 1;
            }
            table.set_rc(idx, 1);
        }

        log::info!(
            "frame allocator: {} frames managed, {} free, table {} KiB at {:#x}",
            table.frame_count,
            table.free_frames,
            table_bytes / 1024,
            table_base.as_u64()
        );

        Ok(Self {
            mapper,
            inner: Mutex::new(table),
        })
    }

    /// Allocate one frame with its refcount set to 1.
    pub fn alloc_frame(&self) -> Option<PhysicalAddress> {
        let mut table = self.inner.lock();
        let idx = table.alloc()?;
        debug_assert_eq!(table.rc(idx), 1);
        Some(table.paddr_of(idx))
    }

    /// Allocate one zero-filled frame.
    pub fn alloc_zeroed_frame(&self) -> Option<PhysicalAddress> {
        let paddr = self.alloc_frame()?;
        // SAFETY: the frame was just allocated, so nothing else maps it yet.
        unsafe { self.mapper.zero_frame(paddr) };
        Some(paddr)
    }

    /// Drop one reference; the frame returns to the free pool at zero.
    ///
    /// Freeing an already-free frame is a logged bug, not a crash.
    pub fn free_frame(&self, paddr: PhysicalAddress) {
        let _ = self.ref_dec(paddr);
    }

    /// Increment a frame's refcount, returning the new count.
    pub fn ref_inc(&self, paddr: PhysicalAddress) -> u32 {
        let mut table = self.inner.lock();
        let Some(idx) = table.index_of(paddr) else {
            log::error!("ref_inc on unmanaged frame {:#x}", paddr.as_u64());
            return 0;
        };
        let rc = table.rc(idx);
        if rc == 0 {
            log::error!("ref_inc on free frame {:#x}", paddr.as_u64());
        }
        table.set_rc(idx, rc + 1);
        rc + 1
    }

    /// Decrement a frame's refcount, returning the new count. At zero the
    /// frame goes back on the free pool.
    pub fn ref_dec(&self, paddr: PhysicalAddress) -> u32 {
        let mut table = self.inner.lock();
        let Some(idx) = table.index_of(paddr) else {
            log::error!("ref_dec on unmanaged frame {:#x}", paddr.as_u64());
            return 0;
        };
        let rc = table.rc(idx);
        if rc == 0 {
            log::error!("double free of frame {:#x}", paddr.as_u64());
            return 0;
        }
        table.set_rc(idx, rc - 1);
        if rc == 1 {
            table.set_free(idx, true);
            table.free_frames += 1;
        }
        rc - 1
    }

    /// Current refcount of a frame. Unmanaged addresses (including
    /// `PhysicalAddress::INVALID`) report 0.
    pub fn refcount(&self, paddr: PhysicalAddress) -> u32 {
        let table = self.inner.lock();
        match table.index_of(paddr) {
            Some(idx) => table.rc(idx),
            None => 0,
        }
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_frames
    }

    /// Number of frames under management.
    pub fn total_frames(&self) -> usize {
        self.inner.lock().frame_count
    }

    /// The linear window this allocator hands out frames from.
    pub fn mapper(&self) -> PhysMapper {
        self.mapper
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use crate::hal::mock::TestArena;

    #[test]
    fn alloc_free_cycle() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let frames = arena.frame_allocator();

        let before = frames.free_frames();
        let f = frames.alloc_frame().unwrap();
        assert!(f.is_page_aligned());
        assert_eq!(frames.refcount(f), 1);
        assert_eq!(frames.free_frames(), before - 1);

        frames.free_frame(f);
        assert_eq!(frames.refcount(f), 0);
        assert_eq!(frames.free_frames(), before);
    }

    #[test]
    fn shared_frame_freed_only_at_zero() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let frames = arena.frame_allocator();

        let f = frames.alloc_frame().unwrap();
        assert_eq!(frames.ref_inc(f), 2);

        frames.free_frame(f);
        assert_eq!(frames.refcount(f), 1);

        frames.free_frame(f);
        assert_eq!(frames.refcount(f), 0);
    }

    #[test]
    fn double_free_is_logged_not_fatal() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let frames = arena.frame_allocator();

        let f = frames.alloc_frame().unwrap();
        frames.free_frame(f);
        frames.free_frame(f); // logged, no panic
        assert_eq!(frames.refcount(f), 0);
    }

    #[test]
    fn invalid_address_reports_zero() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let frames = arena.frame_allocator();
        assert_eq!(frames.refcount(PhysicalAddress::INVALID), 0);
        assert_eq!(frames.refcount(PhysicalAddress::new(0xDEAD_B000)), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = TestArena::new(16 * PAGE_SIZE);
        let frames = arena.frame_allocator();

        let mut held = alloc::vec::Vec::new();
        while let Some(f) = frames.alloc_frame() {
            held.push(f);
        }
        assert!(frames.alloc_frame().is_none());
        assert!(!held.is_empty());

        for f in held {
            frames.free_frame(f);
        }
        assert!(frames.alloc_frame().is_some());
    }

    #[test]
    fn zeroed_frames_are_zero() {
        let arena = TestArena::new(64 * PAGE_SIZE);
        let frames = arena.frame_allocator();

        let f = frames.alloc_frame().unwrap();
        // Dirty the frame, free it, and reallocate zeroed.
        unsafe {
            core::ptr::write_bytes(frames.mapper().translate(f), 0xAA, PAGE_SIZE);
        }
        frames.free_frame(f);

        let z = frames.alloc_zeroed_frame().unwrap();
        let ptr = frames.mapper().translate(z);
        for i in 0..PAGE_SIZE {
            assert_eq!(unsafe { *ptr.add(i) }, 0, "byte {} not zeroed", i);
        }
    }
}
