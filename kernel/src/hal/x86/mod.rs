//! x86-like 32-bit backend
//!
//! Two-level paging, 3/1 GiB split, no NX, port I/O, coherent DMA. The
//! page-table logic in [`paging`] runs everywhere; [`hw`] holds the
//! bare-metal register glue.

pub mod context;
mod hw;
pub mod paging;

pub use context::X86Context;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::enter_user;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    hal::{
        AddrSpace, Hal, HalCapabilities, IrqState, RawFault, RegisterFile, TaskContext,
        VectorHandler, VectorTable,
    },
    mm::{
        fault, FrameAllocator, PageFaultInfo, PageFlags, PhysMapper, PhysicalAddress,
        VirtualAddress, PAGE_SIZE,
    },
};

const PAGE_SIZES: &[usize] = &[PAGE_SIZE];

/// The x86-like HAL instance.
pub struct X86Hal {
    mapper: PhysMapper,
    caps: HalCapabilities,
    /// Master kernel template; also the boot address space.
    kernel_root: PhysicalAddress,
    active_root: AtomicU64,
    irq_enabled: AtomicBool,
    vectors: VectorTable,
}

impl X86Hal {
    /// Build the backend: allocates the master kernel page directory, which
    /// doubles as the boot address space.
    pub fn new(mapper: PhysMapper, frames: &FrameAllocator) -> KernelResult<Self> {
        let kernel_root = frames.alloc_zeroed_frame().ok_or(KernelError::NoMemory {
            what: "kernel page directory",
        })?;

        Ok(Self {
            mapper,
            caps: HalCapabilities {
                arch_name: "x86",
                huge_pages: false,
                nx: false,
                port_io: true,
                iommu: false,
                smp: false,
                fpu: true,
                simd: true,
                dma_coherent: true,
                page_table_levels: 2,
                page_sizes: PAGE_SIZES,
                phys_addr_bits: 32,
                virt_addr_bits: 32,
                kernel_base: VirtualAddress::new(paging::KERNEL_BASE),
                user_top: VirtualAddress::new(paging::KERNEL_BASE),
                register_file: RegisterFile {
                    gp_registers: 8,
                    callee_saved: 4,
                    syscall_args: 6,
                },
                timer_vector: 32,
                fault_vector: 14,
                syscall_vector: 0x80,
                mmio_base: VirtualAddress::new(0xF000_0000),
                mmio_size: 0x0800_0000,
                heap_base: VirtualAddress::new(0xD000_0000),
                heap_max_size: 0x1000_0000,
            },
            kernel_root,
            active_root: AtomicU64::new(kernel_root.as_u64()),
            irq_enabled: AtomicBool::new(false),
            vectors: VectorTable::new(),
        })
    }

    fn resolve(&self, space: AddrSpace) -> Option<PhysicalAddress> {
        if space == AddrSpace::CURRENT {
            return Some(PhysicalAddress::new(self.active_root.load(Ordering::Acquire)));
        }
        if space.is_valid() {
            Some(space.root())
        } else {
            None
        }
    }

    fn is_kernel_half(&self, vaddr: VirtualAddress) -> bool {
        vaddr.as_u64() >= paging::KERNEL_BASE
    }
}

impl Hal for X86Hal {
    fn caps(&self) -> &HalCapabilities {
        &self.caps
    }

    fn current_space(&self) -> AddrSpace {
        AddrSpace::from_root(PhysicalAddress::new(self.active_root.load(Ordering::Acquire)))
    }

    fn kernel_space(&self) -> AddrSpace {
        AddrSpace::from_root(self.kernel_root)
    }

    fn create_space(&self, frames: &FrameAllocator) -> Option<AddrSpace> {
        let root = frames.alloc_zeroed_frame()?;
        // Mirror the kernel-half directory entries; the page tables behind
        // them stay owned by the template.
        for idx in paging::KERNEL_PDE_FIRST..paging::ENTRIES {
            // SAFETY: both roots are live table frames, idx < ENTRIES.
            unsafe {
                let template = *paging::entry_ptr(&self.mapper, self.kernel_root, idx);
                *paging::entry_ptr(&self.mapper, root, idx) = template;
            }
        }
        Some(AddrSpace::from_root(root))
    }

    fn destroy_space(&self, frames: &FrameAllocator, space: AddrSpace) -> KernelResult<()> {
        let root = self.resolve(space).ok_or(KernelError::InvalidParam {
            what: "invalid address space",
        })?;
        if root.as_u64() == self.active_root.load(Ordering::Acquire) {
            return Err(KernelError::Busy {
                what: "active address space",
            });
        }

        for pde_idx in 0..paging::KERNEL_PDE_FIRST {
            // SAFETY: root is a live table frame; indices stay in range.
            unsafe {
                let pde = *paging::entry_ptr(&self.mapper, root, pde_idx);
                if !paging::entry_present(pde) {
                    continue;
                }
                let table = paging::entry_addr(pde);
                for pte_idx in 0..paging::ENTRIES {
                    let pte = *paging::entry_ptr(&self.mapper, table, pte_idx);
                    if paging::entry_present(pte) {
                        frames.ref_dec(paging::entry_addr(pte));
                    }
                }
                // Intermediate tables are owned by this space alone.
                frames.free_frame(table);
            }
        }
        frames.free_frame(root);
        Ok(())
    }

    fn clone_space(&self, frames: &FrameAllocator, src: AddrSpace) -> Option<AddrSpace> {
        let src_root = self.resolve(src)?;
        let dst = self.create_space(frames)?;

        for pde_idx in 0..paging::KERNEL_PDE_FIRST {
            // SAFETY: both roots are live table frames; indices in range.
            unsafe {
                let pde = *paging::entry_ptr(&self.mapper, src_root, pde_idx);
                if !paging::entry_present(pde) {
                    continue;
                }
                let src_table = paging::entry_addr(pde);
                for pte_idx in 0..paging::ENTRIES {
                    let slot = paging::entry_ptr(&self.mapper, src_table, pte_idx);
                    let pte = *slot;
                    if !paging::entry_present(pte) {
                        continue;
                    }
                    let shared = paging::make_cow(pte);
                    let vaddr = VirtualAddress::new(
                        ((pde_idx as u64) << 22) | ((pte_idx as u64) << 12),
                    );
                    let Some(dst_slot) =
                        paging::walk_create(&self.mapper, frames, dst.root(), vaddr)
                    else {
                        // Out of frames mid-clone: tear the partial clone
                        // down (refcounts roll back with it) and fail.
                        let _ = self.destroy_space(frames, dst);
                        return None;
                    };
                    *slot = shared;
                    *dst_slot = shared;
                    frames.ref_inc(paging::entry_addr(pte));
                }
            }
        }
        Some(dst)
    }

    fn switch_space(&self, space: AddrSpace) {
        let Some(root) = self.resolve(space) else {
            log::error!("switch_space on invalid handle");
            return;
        };
        self.active_root.store(root.as_u64(), Ordering::Release);
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        hw::write_cr3(root.as_u64() as u32);
    }

    fn sync_kernel_entry(&self, space: AddrSpace, vaddr: VirtualAddress) -> bool {
        if !self.is_kernel_half(vaddr) {
            return false;
        }
        let Some(root) = self.resolve(space) else {
            return false;
        };
        let idx = paging::pde_index(vaddr);
        // SAFETY: both roots are live table frames, idx < ENTRIES.
        unsafe {
            let template = *paging::entry_ptr(&self.mapper, self.kernel_root, idx);
            if !paging::entry_present(template) {
                return false;
            }
            *paging::entry_ptr(&self.mapper, root, idx) = template;
        }
        true
    }

    fn map(
        &self,
        frames: &FrameAllocator,
        space: AddrSpace,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
    ) -> bool {
        if !vaddr.is_page_aligned()
            || !paddr.is_page_aligned()
            || !paging::addr_in_range(paddr.as_u64())
        {
            return false;
        }
        let Some(root) = self.resolve(space) else {
            return false;
        };
        let Some(slot) = paging::walk_create(&self.mapper, frames, root, vaddr) else {
            return false;
        };
        // SAFETY: slot points at a live PTE.
        unsafe {
            *slot = paging::make_entry(paddr, flags);
        }
        true
    }

    fn unmap(&self, space: AddrSpace, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let root = self.resolve(space)?;
        let slot = paging::walk(&self.mapper, root, vaddr.align_down())?;
        // SAFETY: slot points at a live PTE.
        unsafe {
            let pte = *slot;
            if !paging::entry_present(pte) {
                return None;
            }
            *slot = 0;
            Some(paging::entry_addr(pte))
        }
    }

    fn query(
        &self,
        space: AddrSpace,
        vaddr: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let root = self.resolve(space)?;
        let slot = paging::walk(&self.mapper, root, vaddr.align_down())?;
        // SAFETY: slot points at a live PTE.
        let pte = unsafe { *slot };
        if !paging::entry_present(pte) {
            return None;
        }
        Some((paging::entry_addr(pte), paging::entry_flags(pte)))
    }

    fn protect(
        &self,
        space: AddrSpace,
        vaddr: VirtualAddress,
        set: PageFlags,
        clear: PageFlags,
    ) -> bool {
        let Some(root) = self.resolve(space) else {
            return false;
        };
        let Some(slot) = paging::walk(&self.mapper, root, vaddr.align_down()) else {
            return false;
        };
        // SAFETY: slot points at a live PTE.
        unsafe {
            let pte = *slot;
            if !paging::entry_present(pte) {
                return false;
            }
            let flags = (paging::entry_flags(pte) | set) - clear;
            *slot = paging::make_entry(paging::entry_addr(pte), flags);
        }
        true
    }

    fn flush_tlb(&self, _vaddr: VirtualAddress) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        hw::invlpg(_vaddr.as_u64() as u32);
    }

    fn flush_tlb_all(&self) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        hw::flush_all();
    }

    fn parse_fault(&self, raw: RawFault) -> PageFaultInfo {
        fault::decode_x86(raw.syndrome, raw.address)
    }

    fn irq_enable(&self) {
        self.irq_enabled.store(true, Ordering::Release);
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        hw::irq_enable();
    }

    fn irq_disable(&self) {
        self.irq_enabled.store(false, Ordering::Release);
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        hw::irq_disable();
    }

    fn irq_save(&self) -> IrqState {
        let was = self.irq_enabled.swap(false, Ordering::AcqRel);
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        hw::irq_disable();
        IrqState(was)
    }

    fn irq_restore(&self, state: IrqState) {
        if state.0 {
            self.irq_enable();
        }
    }

    fn register_handler(
        &self,
        vector: u32,
        handler: VectorHandler,
        context: usize,
    ) -> KernelResult<()> {
        self.vectors.register(vector, handler, context)
    }

    fn unregister_handler(&self, vector: u32) -> KernelResult<()> {
        self.vectors.unregister(vector)
    }

    fn dispatch(&self, vector: u32) {
        if !self.vectors.dispatch(vector) {
            log::warn!("spurious vector {}", vector);
        }
    }

    fn eoi(&self, _irq: u32) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        hw::pic_eoi(_irq);
    }

    // DMA is cache-coherent on this architecture; maintenance is a no-op.
    fn cache_clean(&self, _addr: VirtualAddress, _size: usize) {}
    fn cache_invalidate(&self, _addr: VirtualAddress, _size: usize) {}
    fn cache_clean_invalidate(&self, _addr: VirtualAddress, _size: usize) {}

    fn new_context(
        &self,
        entry: VirtualAddress,
        stack_top: VirtualAddress,
        space: AddrSpace,
    ) -> TaskContext {
        TaskContext::X86(X86Context::new(entry, stack_top, space))
    }

    unsafe fn context_switch(&self, _from: *mut TaskContext, _to: *const TaskContext) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: forwarded caller contract; both contexts are X86 on this
        // backend.
        unsafe {
            if let (TaskContext::X86(from), TaskContext::X86(to)) = (&mut *_from, &*_to) {
                hw::x86_context_switch(from as *mut X86Context, to as *const X86Context);
            }
        }
    }

    fn wait_for_interrupt(&self) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        hw::halt();
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        core::hint::spin_loop();
    }

    fn platform_reset(&self) -> KernelResult<()> {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            hw::platform_reset();
            Ok(())
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        Err(KernelError::NotSupported {
            operation: "platform reset",
        })
    }

    fn platform_poweroff(&self) -> KernelResult<()> {
        Err(KernelError::NotSupported {
            operation: "platform poweroff",
        })
    }
}
