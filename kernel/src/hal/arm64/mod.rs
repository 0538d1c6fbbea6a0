//! ARM-like 64-bit backend
//!
//! Four-level 4 KiB-granule translation, high kernel half, NX, non-coherent
//! DMA (cache maintenance is real on metal). The table logic in [`paging`]
//! runs everywhere; [`hw`] holds the bare-metal register glue.

pub mod context;
mod hw;
pub mod paging;

pub use context::Arm64Context;
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
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

/// The ARM-like HAL instance.
pub struct Arm64Hal {
    mapper: PhysMapper,
    caps: HalCapabilities,
    /// Master kernel template; also the boot address space.
    kernel_root: PhysicalAddress,
    active_root: AtomicU64,
    irq_enabled: AtomicBool,
    vectors: VectorTable,
}

impl Arm64Hal {
    /// Build the backend: allocates the master kernel root table, which
    /// doubles as the boot address space.
    pub fn new(mapper: PhysMapper, frames: &FrameAllocator) -> KernelResult<Self> {
        let kernel_root = frames.alloc_zeroed_frame().ok_or(KernelError::NoMemory {
            what: "kernel root table",
        })?;

        Ok(Self {
            mapper,
            caps: HalCapabilities {
                arch_name: "arm64",
                huge_pages: false,
                nx: true,
                port_io: false,
                iommu: false,
                smp: false,
                fpu: true,
                simd: true,
                dma_coherent: false,
                page_table_levels: 4,
                page_sizes: PAGE_SIZES,
                phys_addr_bits: 48,
                virt_addr_bits: 48,
                kernel_base: VirtualAddress::new(paging::KERNEL_BASE),
                user_top: VirtualAddress::new(0x0000_8000_0000_0000),
                register_file: RegisterFile {
                    gp_registers: 31,
                    callee_saved: 12,
                    syscall_args: 6,
                },
                timer_vector: 30,
                fault_vector: 3,
                syscall_vector: 8,
                mmio_base: VirtualAddress::new(0xFFFF_9000_0000_0000),
                mmio_size: 0x4000_0000,
                heap_base: VirtualAddress::new(0xFFFF_8800_0000_0000),
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

    /// Recursively free the user-half table tree under `table` at `level`,
    /// dropping one frame reference per mapped page.
    fn free_tree(&self, frames: &FrameAllocator, table: PhysicalAddress, level: usize) {
        for idx in 0..paging::ENTRIES {
            // SAFETY: table is a live translation table; idx < ENTRIES.
            let desc = unsafe { *paging::entry_ptr(&self.mapper, table, idx) };
            if !paging::entry_present(desc) {
                continue;
            }
            if level == paging::LEVELS - 1 {
                frames.ref_dec(paging::entry_addr(desc));
            } else {
                self.free_tree(frames, paging::entry_addr(desc), level + 1);
            }
        }
        // Tables themselves are owned by this space alone.
        frames.free_frame(table);
    }

    /// Walk the user-half leaves of `src`, COW-marking each and mirroring
    /// it into `dst`. Returns false on frame exhaustion.
    fn clone_user_tree(
        &self,
        frames: &FrameAllocator,
        src_table: PhysicalAddress,
        dst_root: PhysicalAddress,
        level: usize,
        va_prefix: u64,
    ) -> bool {
        for idx in 0..paging::ENTRIES {
            if level == 0 && idx >= paging::KERNEL_L0_FIRST {
                break;
            }
            // SAFETY: src_table is a live translation table; idx < ENTRIES.
            let slot = unsafe { paging::entry_ptr(&self.mapper, src_table, idx) };
            let desc = unsafe { *slot };
            if !paging::entry_present(desc) {
                continue;
            }
            let shift = 12 + 9 * (paging::LEVELS - 1 - level) as u64;
            let va = va_prefix | ((idx as u64) << shift);
            if level == paging::LEVELS - 1 {
                let shared = paging::make_cow(desc);
                let vaddr = VirtualAddress::new(va);
                let Some(dst_slot) =
                    paging::walk_create(&self.mapper, frames, dst_root, vaddr)
                else {
                    return false;
                };
                // SAFETY: both slots are live descriptor slots.
                unsafe {
                    *slot = shared;
                    *dst_slot = shared;
                }
                frames.ref_inc(paging::entry_addr(desc));
            } else if !self.clone_user_tree(
                frames,
                paging::entry_addr(desc),
                dst_root,
                level + 1,
                va,
            ) {
                return false;
            }
        }
        true
    }
}

impl Hal for Arm64Hal {
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
        for idx in paging::KERNEL_L0_FIRST..paging::ENTRIES {
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

        for idx in 0..paging::KERNEL_L0_FIRST {
            // SAFETY: root is a live table frame; idx < ENTRIES.
            let desc = unsafe { *paging::entry_ptr(&self.mapper, root, idx) };
            if paging::entry_present(desc) {
                self.free_tree(frames, paging::entry_addr(desc), 1);
            }
        }
        frames.free_frame(root);
        Ok(())
    }

    fn clone_space(&self, frames: &FrameAllocator, src: AddrSpace) -> Option<AddrSpace> {
        let src_root = self.resolve(src)?;
        let dst = self.create_space(frames)?;
        if !self.clone_user_tree(frames, src_root, dst.root(), 0, 0) {
            // Out of frames mid-clone: tear the partial clone down
            // (refcounts roll back with it) and fail.
            let _ = self.destroy_space(frames, dst);
            return None;
        }
        Some(dst)
    }

    fn switch_space(&self, space: AddrSpace) {
        let Some(root) = self.resolve(space) else {
            log::error!("switch_space on invalid handle");
            return;
        };
        self.active_root.store(root.as_u64(), Ordering::Release);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::write_ttbr0(root.as_u64());
    }

    fn sync_kernel_entry(&self, space: AddrSpace, vaddr: VirtualAddress) -> bool {
        if !self.is_kernel_half(vaddr) {
            return false;
        }
        let Some(root) = self.resolve(space) else {
            return false;
        };
        let idx = paging::index_at(0, vaddr);
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
        if !vaddr.is_page_aligned() || !paddr.is_page_aligned() {
            return false;
        }
        let Some(root) = self.resolve(space) else {
            return false;
        };
        let Some(slot) = paging::walk_create(&self.mapper, frames, root, vaddr) else {
            return false;
        };
        // SAFETY: slot points at a live descriptor.
        unsafe {
            *slot = paging::make_entry(paddr, flags);
        }
        true
    }

    fn unmap(&self, space: AddrSpace, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let root = self.resolve(space)?;
        let slot = paging::walk(&self.mapper, root, vaddr.align_down())?;
        // SAFETY: slot points at a live descriptor.
        unsafe {
            let desc = *slot;
            if !paging::entry_present(desc) {
                return None;
            }
            *slot = 0;
            Some(paging::entry_addr(desc))
        }
    }

    fn query(
        &self,
        space: AddrSpace,
        vaddr: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let root = self.resolve(space)?;
        let slot = paging::walk(&self.mapper, root, vaddr.align_down())?;
        // SAFETY: slot points at a live descriptor.
        let desc = unsafe { *slot };
        if !paging::entry_present(desc) {
            return None;
        }
        Some((paging::entry_addr(desc), paging::entry_flags(desc)))
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
        // SAFETY: slot points at a live descriptor.
        unsafe {
            let desc = *slot;
            if !paging::entry_present(desc) {
                return false;
            }
            let flags = (paging::entry_flags(desc) | set) - clear;
            *slot = paging::make_entry(paging::entry_addr(desc), flags);
        }
        true
    }

    fn flush_tlb(&self, _vaddr: VirtualAddress) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::tlbi_vaddr(_vaddr.as_u64());
    }

    fn flush_tlb_all(&self) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::tlbi_all();
    }

    fn parse_fault(&self, raw: RawFault) -> PageFaultInfo {
        fault::decode_arm64(raw.syndrome, raw.address)
    }

    fn irq_enable(&self) {
        self.irq_enabled.store(true, Ordering::Release);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::irq_enable();
    }

    fn irq_disable(&self) {
        self.irq_enabled.store(false, Ordering::Release);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::irq_disable();
    }

    fn irq_save(&self) -> IrqState {
        let was = self.irq_enabled.swap(false, Ordering::AcqRel);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
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
        // Interrupt completion is written to the GIC CPU interface by the
        // interrupt-controller driver, which lives outside the core.
    }

    fn cache_clean(&self, _addr: VirtualAddress, _size: usize) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::dcache_clean(_addr.as_u64(), _size);
    }

    fn cache_invalidate(&self, _addr: VirtualAddress, _size: usize) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::dcache_invalidate(_addr.as_u64(), _size);
    }

    fn cache_clean_invalidate(&self, _addr: VirtualAddress, _size: usize) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::dcache_clean_invalidate(_addr.as_u64(), _size);
    }

    fn new_context(
        &self,
        entry: VirtualAddress,
        stack_top: VirtualAddress,
        space: AddrSpace,
    ) -> TaskContext {
        TaskContext::Arm64(Arm64Context::new(entry, stack_top, space))
    }

    unsafe fn context_switch(&self, _from: *mut TaskContext, _to: *const TaskContext) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: forwarded caller contract; both contexts are Arm64 on
        // this backend.
        unsafe {
            if let (TaskContext::Arm64(from), TaskContext::Arm64(to)) = (&mut *_from, &*_to) {
                hw::arm64_context_switch(from as *mut Arm64Context, to as *const Arm64Context);
            }
        }
    }

    fn wait_for_interrupt(&self) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        hw::wait_for_interrupt();
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        core::hint::spin_loop();
    }

    fn platform_reset(&self) -> KernelResult<()> {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        {
            hw::platform_reset();
            Ok(())
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        Err(KernelError::NotSupported {
            operation: "platform reset",
        })
    }

    fn platform_poweroff(&self) -> KernelResult<()> {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        {
            hw::platform_poweroff();
            Ok(())
        }
        #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
        Err(KernelError::NotSupported {
            operation: "platform poweroff",
        })
    }
}
