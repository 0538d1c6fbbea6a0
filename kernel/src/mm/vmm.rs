//! Virtual memory manager
//!
//! Sits on the HAL contract and owns the policy the HAL does not: kernel-half
//! synchronization between address spaces, copy-on-write orchestration,
//! demand mapping of user heap/stack extents, MMIO window carving, and the
//! user-memory accessors the syscall layer funnels through. Page-table edits
//! made here are followed by the required TLB invalidation before returning.

#[cfg(feature = "alloc")]
extern crate alloc;

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    hal::{AddrSpace, Hal},
    mm::{
        FrameAllocator, PageFaultInfo, PageFlags, PhysMapper, PhysicalAddress, VirtualAddress,
        PAGE_SIZE,
    },
};

/// Outcome of a page-fault resolution attempt, consumed by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The mapping is fixed; retry the faulting access.
    Handled,
    /// Unresolvable user fault; the scheduler terminates the task.
    KillTask,
    /// Unresolvable kernel fault; halt with diagnostics.
    Panic,
}

/// Per-task user-space layout: brk heap, downward-growing stack, and the
/// mmap cursor region. Faults inside the declared extents are demand-mapped.
#[derive(Debug, Clone, Copy)]
pub struct UserExtents {
    pub heap_start: VirtualAddress,
    /// Current brk; pages in `[heap_start, heap_end)` are demand-mapped.
    pub heap_end: VirtualAddress,
    pub heap_max: VirtualAddress,
    /// Exclusive top of the stack region.
    pub stack_top: VirtualAddress,
    /// Lowest address the stack may grow to.
    pub stack_limit: VirtualAddress,
    pub mmap_base: VirtualAddress,
    pub mmap_cursor: VirtualAddress,
}

impl UserExtents {
    pub fn contains_heap(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.heap_start && vaddr < self.heap_end
    }

    pub fn contains_stack(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.stack_limit && vaddr < self.stack_top
    }

    /// Whether a fault at `vaddr` is demand-mappable.
    pub fn covers(&self, vaddr: VirtualAddress) -> bool {
        self.contains_heap(vaddr) || self.contains_stack(vaddr)
    }
}

/// The VMM proper. One instance per machine, created at bootstrap; holds
/// only window cursors, so tests build as many as they like.
pub struct Vmm {
    mapper: PhysMapper,
    mmio_cursor: Mutex<u64>,
}

impl Vmm {
    pub fn new<H: Hal>(hal: &H, mapper: PhysMapper) -> Self {
        Self {
            mapper,
            mmio_cursor: Mutex::new(hal.caps().mmio_base.as_u64()),
        }
    }

    /// Explicit mapping; thin wrapper that adds error typing and the TLB
    /// invalidation the HAL leaves to callers.
    pub fn map_page<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        space: AddrSpace,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        if !vaddr.is_page_aligned() || !paddr.is_page_aligned() {
            return Err(KernelError::InvalidParam {
                what: "unaligned mapping",
            });
        }
        if !hal.map(frames, space, vaddr, paddr, flags) {
            return Err(KernelError::NoMemory {
                what: "page-table allocation",
            });
        }
        hal.flush_tlb(vaddr);
        Ok(())
    }

    /// Remove a mapping and drop the frame reference it held.
    pub fn release_page<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        space: AddrSpace,
        vaddr: VirtualAddress,
    ) -> KernelResult<PhysicalAddress> {
        let paddr = hal.unmap(space, vaddr).ok_or(KernelError::NotFound {
            what: "mapping to unmap",
        })?;
        frames.ref_dec(paddr);
        hal.flush_tlb(vaddr);
        Ok(paddr)
    }

    /// Copy-on-write clone of `src` for fork. Shares every user frame
    /// read-only in both spaces and flushes the source's stale write
    /// permissions out of the TLB before returning.
    pub fn clone_space_cow<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        src: AddrSpace,
    ) -> KernelResult<AddrSpace> {
        let dst = hal.clone_space(frames, src).ok_or(KernelError::NoMemory {
            what: "address-space clone",
        })?;
        hal.flush_tlb_all();
        Ok(dst)
    }

    /// Tear down a space: per-frame refcounts drop, page tables are freed.
    pub fn destroy_space<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        space: AddrSpace,
    ) -> KernelResult<()> {
        hal.destroy_space(frames, space)
    }

    /// Resolve a page fault against the current address space.
    ///
    /// Order of business: kernel-half lazy sync, copy-on-write, spurious
    /// permission/aging refresh, demand mapping inside the task's extents,
    /// then the verdict for everything else.
    pub fn handle_fault<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        extents: Option<&UserExtents>,
        info: &PageFaultInfo,
    ) -> FaultResolution {
        let page = info.vaddr.align_down();
        let kernel_half = info.vaddr >= hal.caps().kernel_base;

        // Kernel-half miss: the master template may have grown since this
        // space was created; install the missing top-level entry.
        if kernel_half && !info.is_present && !info.is_user {
            if hal.sync_kernel_entry(AddrSpace::CURRENT, page) {
                hal.flush_tlb(page);
                return FaultResolution::Handled;
            }
            log::error!(
                "unhandled kernel fault at {:#x} (syndrome {:#x})",
                info.vaddr.as_u64(),
                info.raw
            );
            return FaultResolution::Panic;
        }

        if info.is_present {
            if let Some((old, flags)) = hal.query(AddrSpace::CURRENT, page) {
                if info.is_write && flags.contains(PageFlags::COW) {
                    return self.resolve_cow(hal, frames, page, old, flags, info);
                }
                let write_ok = !info.is_write || flags.contains(PageFlags::WRITE);
                if write_ok {
                    // Spurious: aging (access flag) or a stale TLB entry.
                    hal.protect(
                        AddrSpace::CURRENT,
                        page,
                        PageFlags::ACCESSED,
                        PageFlags::empty(),
                    );
                    hal.flush_tlb(page);
                    return FaultResolution::Handled;
                }
            }
        } else if let Some(extents) = extents {
            if extents.covers(page) {
                return self.demand_map(hal, frames, page, info);
            }
        }

        if info.is_user {
            log::debug!(
                "killing task: fault at {:#x} (write={} exec={} syndrome {:#x})",
                info.vaddr.as_u64(),
                info.is_write,
                info.is_exec,
                info.raw
            );
            FaultResolution::KillTask
        } else {
            log::error!(
                "unhandled kernel fault at {:#x} (syndrome {:#x})",
                info.vaddr.as_u64(),
                info.raw
            );
            FaultResolution::Panic
        }
    }

    /// The COW protocol. Either arm re-establishes the invariant that
    /// write-enabled frames have refcount 1.
    fn resolve_cow<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        page: VirtualAddress,
        old: PhysicalAddress,
        flags: PageFlags,
        info: &PageFaultInfo,
    ) -> FaultResolution {
        if frames.refcount(old) == 1 {
            // Sole owner left; reclaim the page in place.
            hal.protect(AddrSpace::CURRENT, page, PageFlags::WRITE, PageFlags::COW);
            hal.flush_tlb(page);
            return FaultResolution::Handled;
        }

        let Some(new) = frames.alloc_frame() else {
            log::warn!("out of frames during COW at {:#x}", page.as_u64());
            return if info.is_user {
                FaultResolution::KillTask
            } else {
                FaultResolution::Panic
            };
        };
        // SAFETY: `old` is mapped read-only (no writer exists) and `new`
        // was just allocated.
        unsafe { self.mapper.copy_frame(old, new) };

        let private = (flags - PageFlags::COW) | PageFlags::WRITE;
        if !hal.map(frames, AddrSpace::CURRENT, page, new, private) {
            frames.free_frame(new);
            return if info.is_user {
                FaultResolution::KillTask
            } else {
                FaultResolution::Panic
            };
        }
        frames.ref_dec(old);
        hal.flush_tlb(page);
        FaultResolution::Handled
    }

    /// Back a fault inside a declared heap/stack extent with a zeroed frame.
    fn demand_map<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        page: VirtualAddress,
        info: &PageFaultInfo,
    ) -> FaultResolution {
        let Some(frame) = frames.alloc_zeroed_frame() else {
            log::warn!("out of frames during demand map at {:#x}", page.as_u64());
            return FaultResolution::KillTask;
        };
        if !hal.map(frames, AddrSpace::CURRENT, page, frame, PageFlags::user_data()) {
            frames.free_frame(frame);
            return FaultResolution::KillTask;
        }
        let _ = info;
        hal.flush_tlb(page);
        FaultResolution::Handled
    }

    /// Map a device range uncached into the kernel MMIO window, visible to
    /// every address space through the master template (other spaces pick
    /// the top-level entry up through kernel-half sync).
    pub fn map_mmio<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        paddr: PhysicalAddress,
        size: usize,
    ) -> KernelResult<VirtualAddress> {
        self.map_device(hal, frames, paddr, size, PageFlags::kernel_data() | PageFlags::NOCACHE)
    }

    /// Map a framebuffer. Uses the arch's write-combining memory type when
    /// it has one; the flag encoding degrades to plain uncached otherwise.
    pub fn map_framebuffer<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        paddr: PhysicalAddress,
        size: usize,
    ) -> KernelResult<VirtualAddress> {
        self.map_device(hal, frames, paddr, size, PageFlags::kernel_data() | PageFlags::NOCACHE)
    }

    fn map_device<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        paddr: PhysicalAddress,
        size: usize,
        flags: PageFlags,
    ) -> KernelResult<VirtualAddress> {
        if size == 0 {
            return Err(KernelError::InvalidParam {
                what: "zero-size device mapping",
            });
        }
        let first = paddr.align_down();
        let span = (paddr.as_u64() - first.as_u64()) as usize + size;
        let pages = span.div_ceil(PAGE_SIZE);

        let base = {
            let mut cursor = self.mmio_cursor.lock();
            let base = *cursor;
            let end = hal.caps().mmio_base.as_u64() + hal.caps().mmio_size as u64;
            if base + (pages * PAGE_SIZE) as u64 > end {
                return Err(KernelError::NoMemory {
                    what: "MMIO window exhausted",
                });
            }
            *cursor += (pages * PAGE_SIZE) as u64;
            base
        };

        let kernel_space = hal.kernel_space();
        for i in 0..pages {
            let va = VirtualAddress::new(base + (i * PAGE_SIZE) as u64);
            let pa = first.offset((i * PAGE_SIZE) as u64);
            if !hal.map(frames, kernel_space, va, pa, flags) {
                for j in 0..i {
                    let va = VirtualAddress::new(base + (j * PAGE_SIZE) as u64);
                    hal.unmap(kernel_space, va);
                    hal.flush_tlb(va);
                }
                return Err(KernelError::NoMemory {
                    what: "MMIO page tables",
                });
            }
            hal.flush_tlb(va);
        }
        Ok(VirtualAddress::new(base + (paddr.as_u64() - first.as_u64())))
    }

    /// Unmap a device range mapped by [`Self::map_mmio`]. Device frames are
    /// not RAM and take no refcount bookkeeping.
    pub fn unmap_mmio<H: Hal>(&self, hal: &H, vaddr: VirtualAddress, size: usize) {
        let first = vaddr.align_down();
        let span = (vaddr.as_u64() - first.as_u64()) as usize + size;
        let kernel_space = hal.kernel_space();
        for i in 0..span.div_ceil(PAGE_SIZE) {
            let va = first.offset((i * PAGE_SIZE) as u64);
            hal.unmap(kernel_space, va);
            hal.flush_tlb(va);
        }
    }

    /// Page-table walk on the current space. Heap pointers are dynamically
    /// mapped, so there is no linear shortcut.
    pub fn virt_to_phys<H: Hal>(&self, hal: &H, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let (frame, flags) = hal.query(AddrSpace::CURRENT, vaddr)?;
        if !flags.contains(PageFlags::PRESENT) {
            return None;
        }
        Some(frame.offset(vaddr.page_offset()))
    }

    /// Map `pages` fresh frames at `base` in the kernel half; the heap's
    /// growth callback lands here.
    pub fn grow_kernel_heap<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        base: VirtualAddress,
        pages: usize,
    ) -> bool {
        let kernel_space = hal.kernel_space();
        for i in 0..pages {
            let va = base.offset((i * PAGE_SIZE) as u64);
            let Some(frame) = frames.alloc_frame() else {
                for j in 0..i {
                    let va = base.offset((j * PAGE_SIZE) as u64);
                    if let Some(f) = hal.unmap(kernel_space, va) {
                        frames.free_frame(f);
                    }
                    hal.flush_tlb(va);
                }
                return false;
            };
            if !hal.map(frames, kernel_space, va, frame, PageFlags::kernel_data()) {
                frames.free_frame(frame);
                for j in 0..i {
                    let va = base.offset((j * PAGE_SIZE) as u64);
                    if let Some(f) = hal.unmap(kernel_space, va) {
                        frames.free_frame(f);
                    }
                    hal.flush_tlb(va);
                }
                return false;
            }
            hal.flush_tlb(va);
        }
        true
    }

    // -- user memory accessors ---------------------------------------------

    /// Copy kernel bytes into the current user space, breaking COW shares
    /// along the way exactly as a user write would.
    pub fn copy_to_user<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        dst: VirtualAddress,
        bytes: &[u8],
    ) -> KernelResult<()> {
        if dst.as_u64() == 0 {
            return Err(KernelError::InvalidParam {
                what: "null user pointer",
            });
        }
        let mut offset = 0usize;
        while offset < bytes.len() {
            let va = dst.offset(offset as u64);
            let page = va.align_down();
            let paddr = self.writable_user_frame(hal, frames, page)?;
            let chunk = (PAGE_SIZE - va.page_offset() as usize).min(bytes.len() - offset);
            // SAFETY: the frame is mapped writable for the current user
            // space and lies inside the linear window.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(offset),
                    self.mapper.translate(paddr.offset(va.page_offset())),
                    chunk,
                );
            }
            offset += chunk;
        }
        Ok(())
    }

    /// Copy bytes out of the current user space.
    pub fn copy_from_user<H: Hal>(
        &self,
        hal: &H,
        src: VirtualAddress,
        buf: &mut [u8],
    ) -> KernelResult<()> {
        if src.as_u64() == 0 {
            return Err(KernelError::InvalidParam {
                what: "null user pointer",
            });
        }
        let mut offset = 0usize;
        while offset < buf.len() {
            let va = src.offset(offset as u64);
            let page = va.align_down();
            let (paddr, flags) =
                hal.query(AddrSpace::CURRENT, page)
                    .ok_or(KernelError::NotFound {
                        what: "user page",
                    })?;
            if !flags.contains(PageFlags::USER) {
                return Err(KernelError::Permission {
                    operation: "read of non-user memory",
                });
            }
            let chunk = (PAGE_SIZE - va.page_offset() as usize).min(buf.len() - offset);
            // SAFETY: the frame is mapped for the current user space and
            // lies inside the linear window.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.mapper.translate(paddr.offset(va.page_offset())),
                    buf.as_mut_ptr().add(offset),
                    chunk,
                );
            }
            offset += chunk;
        }
        Ok(())
    }

    /// Read a NUL-terminated user string of at most `max` bytes.
    #[cfg(feature = "alloc")]
    pub fn read_user_cstr<H: Hal>(
        &self,
        hal: &H,
        src: VirtualAddress,
        max: usize,
    ) -> KernelResult<alloc::string::String> {
        use alloc::{string::String, vec};

        let mut buf = vec![0u8; max];
        let mut len = 0usize;
        'outer: while len < max {
            let chunk_len = (PAGE_SIZE - src.offset(len as u64).page_offset() as usize)
                .min(max - len);
            self.copy_from_user(hal, src.offset(len as u64), &mut buf[len..len + chunk_len])?;
            for i in len..len + chunk_len {
                if buf[i] == 0 {
                    len = i;
                    break 'outer;
                }
            }
            len += chunk_len;
        }
        buf.truncate(len);
        String::from_utf8(buf).map_err(|_| KernelError::InvalidParam {
            what: "non-UTF-8 user string",
        })
    }

    /// Translate a user page for writing, resolving COW exactly as the
    /// fault path would.
    fn writable_user_frame<H: Hal>(
        &self,
        hal: &H,
        frames: &FrameAllocator,
        page: VirtualAddress,
    ) -> KernelResult<PhysicalAddress> {
        for _ in 0..2 {
            let Some((paddr, flags)) = hal.query(AddrSpace::CURRENT, page) else {
                return Err(KernelError::NotFound {
                    what: "user page",
                });
            };
            if !flags.contains(PageFlags::USER) {
                return Err(KernelError::Permission {
                    operation: "write to non-user memory",
                });
            }
            if flags.contains(PageFlags::WRITE) {
                return Ok(paddr);
            }
            if !flags.contains(PageFlags::COW) {
                return Err(KernelError::Permission {
                    operation: "write to read-only user memory",
                });
            }
            let synthetic = PageFaultInfo {
                vaddr: page,
                is_write: true,
                is_user: true,
                is_exec: false,
                is_present: true,
                is_reserved_bit: false,
                raw: 0,
            };
            if self.handle_fault(hal, frames, None, &synthetic) != FaultResolution::Handled {
                return Err(KernelError::NoMemory {
                    what: "COW break for user copy",
                });
            }
        }
        Err(KernelError::Permission {
            operation: "write to user memory",
        })
    }
}
