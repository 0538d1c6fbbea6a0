//! HAL test double
//!
//! [`MockHal`] implements the full HAL contract over plain map structures so
//! the VMM, scheduler, router, and syscall layers can be exercised on a
//! host without a machine. [`TestArena`] pairs it with a heap-backed
//! "physical memory" window so the *real* page-table backends also run
//! end-to-end in tests. On hosted builds the mock is the [`ActiveHal`],
//! which is what makes the boot path itself testable.
//!
//! [`ActiveHal`]: crate::hal::ActiveHal

extern crate alloc;

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    boot::{BootInfo, MemoryRegion, MemoryRegionKind},
    error::{KernelError, KernelResult},
    hal::{
        arm64::Arm64Context, AddrSpace, Hal, HalCapabilities, IrqState, RawFault, RegisterFile,
        TaskContext, VectorHandler, VectorTable,
    },
    mm::{
        fault, FrameAllocator, PageFaultInfo, PageFlags, PhysMapper, PhysicalAddress,
        VirtualAddress, PAGE_SIZE,
    },
};

/// Where simulated physical memory starts in test arenas.
pub const ARENA_PHYS_BASE: u64 = 0x10_0000;

const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

const PAGE_SIZES: &[usize] = &[PAGE_SIZE];

/// Observable side effects recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    SpaceSwitch(u64),
    TlbFlushPage(u64),
    TlbFlushAll,
    Eoi(u32),
    ContextSwitch,
    Idle,
    Reset,
    Poweroff,
}

struct MockState {
    /// root -> (page vaddr -> (frame, flags))
    spaces: BTreeMap<u64, BTreeMap<u64, (PhysicalAddress, PageFlags)>>,
    next_root: u64,
}

/// Software model of the HAL contract.
pub struct MockHal {
    caps: HalCapabilities,
    kernel_root: u64,
    state: Mutex<MockState>,
    active_root: AtomicU64,
    irq_enabled: AtomicBool,
    vectors: VectorTable,
    events: Mutex<Vec<MockEvent>>,
}

impl MockHal {
    /// Uniform constructor signature with the real backends; the mock needs
    /// neither the window nor the frame pool to build its tables.
    pub fn new(_mapper: PhysMapper, _frames: &FrameAllocator) -> KernelResult<Self> {
        Ok(Self::default())
    }

    /// Drain the recorded side effects.
    pub fn take_events(&self) -> Vec<MockEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    /// How many context switches were requested.
    pub fn context_switches(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, MockEvent::ContextSwitch))
            .count()
    }

    fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    fn resolve(&self, space: AddrSpace) -> Option<u64> {
        if space == AddrSpace::CURRENT {
            return Some(self.active_root.load(Ordering::Acquire));
        }
        if space.is_valid() {
            Some(space.root().as_u64())
        } else {
            None
        }
    }

    /// COW entries never carry the write bit, matching the real encoders.
    fn normalize(flags: PageFlags) -> PageFlags {
        if flags.contains(PageFlags::COW) {
            flags - PageFlags::WRITE
        } else {
            flags
        }
    }
}

impl Default for MockHal {
    fn default() -> Self {
        let kernel_root = 0x100_0000u64;
        let mut spaces = BTreeMap::new();
        spaces.insert(kernel_root, BTreeMap::new());

        Self {
            caps: HalCapabilities {
                arch_name: "mock",
                huge_pages: false,
                nx: true,
                port_io: false,
                iommu: false,
                smp: false,
                fpu: true,
                simd: true,
                dma_coherent: true,
                page_table_levels: 4,
                page_sizes: PAGE_SIZES,
                phys_addr_bits: 48,
                virt_addr_bits: 48,
                kernel_base: VirtualAddress::new(KERNEL_BASE),
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
            state: Mutex::new(MockState {
                spaces,
                next_root: kernel_root + PAGE_SIZE as u64,
            }),
            active_root: AtomicU64::new(kernel_root),
            irq_enabled: AtomicBool::new(false),
            vectors: VectorTable::new(),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl Hal for MockHal {
    fn caps(&self) -> &HalCapabilities {
        &self.caps
    }

    fn current_space(&self) -> AddrSpace {
        AddrSpace::from_root(PhysicalAddress::new(self.active_root.load(Ordering::Acquire)))
    }

    fn kernel_space(&self) -> AddrSpace {
        AddrSpace::from_root(PhysicalAddress::new(self.kernel_root))
    }

    fn create_space(&self, _frames: &FrameAllocator) -> Option<AddrSpace> {
        let mut state = self.state.lock();
        let root = state.next_root;
        state.next_root += PAGE_SIZE as u64;

        // Mirror the kernel half from the template.
        let kernel_half: BTreeMap<u64, (PhysicalAddress, PageFlags)> = state
            .spaces
            .get(&self.kernel_root)
            .map(|template| {
                template
                    .range(KERNEL_BASE..)
                    .map(|(k, v)| (*k, *v))
                    .collect()
            })
            .unwrap_or_default();
        state.spaces.insert(root, kernel_half);
        Some(AddrSpace::from_root(PhysicalAddress::new(root)))
    }

    fn destroy_space(&self, frames: &FrameAllocator, space: AddrSpace) -> KernelResult<()> {
        let root = self.resolve(space).ok_or(KernelError::InvalidParam {
            what: "invalid address space",
        })?;
        if root == self.active_root.load(Ordering::Acquire) {
            return Err(KernelError::Busy {
                what: "active address space",
            });
        }
        let mut state = self.state.lock();
        let mappings = state.spaces.remove(&root).ok_or(KernelError::NotFound {
            what: "address space",
        })?;
        for (vaddr, (paddr, _)) in mappings {
            if vaddr < KERNEL_BASE {
                frames.ref_dec(paddr);
            }
        }
        Ok(())
    }

    fn clone_space(&self, frames: &FrameAllocator, src: AddrSpace) -> Option<AddrSpace> {
        let src_root = self.resolve(src)?;
        let dst = self.create_space(frames)?;
        let dst_root = dst.root().as_u64();

        let mut state = self.state.lock();
        let src_mappings = state.spaces.get(&src_root)?.clone();
        let mut shared_user = BTreeMap::new();
        for (vaddr, (paddr, flags)) in src_mappings.iter() {
            if *vaddr >= KERNEL_BASE {
                continue;
            }
            let shared = (*flags - PageFlags::WRITE) | PageFlags::COW;
            shared_user.insert(*vaddr, (*paddr, shared));
            frames.ref_inc(*paddr);
        }
        if let Some(src_map) = state.spaces.get_mut(&src_root) {
            for (vaddr, entry) in shared_user.iter() {
                src_map.insert(*vaddr, *entry);
            }
        }
        if let Some(dst_map) = state.spaces.get_mut(&dst_root) {
            dst_map.extend(shared_user);
        }
        Some(dst)
    }

    fn switch_space(&self, space: AddrSpace) {
        let Some(root) = self.resolve(space) else {
            log::error!("switch_space on invalid handle");
            return;
        };
        self.active_root.store(root, Ordering::Release);
        self.record(MockEvent::SpaceSwitch(root));
    }

    fn sync_kernel_entry(&self, space: AddrSpace, vaddr: VirtualAddress) -> bool {
        if vaddr.as_u64() < KERNEL_BASE {
            return false;
        }
        let Some(root) = self.resolve(space) else {
            return false;
        };
        let page = vaddr.align_down().as_u64();
        let mut state = self.state.lock();
        let Some(entry) = state
            .spaces
            .get(&self.kernel_root)
            .and_then(|t| t.get(&page))
            .copied()
        else {
            return false;
        };
        if let Some(map) = state.spaces.get_mut(&root) {
            map.insert(page, entry);
            return true;
        }
        false
    }

    fn map(
        &self,
        _frames: &FrameAllocator,
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
        let mut state = self.state.lock();
        match state.spaces.get_mut(&root) {
            Some(map) => {
                map.insert(vaddr.as_u64(), (paddr, Self::normalize(flags)));
                true
            }
            None => false,
        }
    }

    fn unmap(&self, space: AddrSpace, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let root = self.resolve(space)?;
        let mut state = self.state.lock();
        state
            .spaces
            .get_mut(&root)?
            .remove(&vaddr.align_down().as_u64())
            .map(|(paddr, _)| paddr)
    }

    fn query(
        &self,
        space: AddrSpace,
        vaddr: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let root = self.resolve(space)?;
        let state = self.state.lock();
        state
            .spaces
            .get(&root)?
            .get(&vaddr.align_down().as_u64())
            .copied()
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
        let mut state = self.state.lock();
        let Some(entry) = state
            .spaces
            .get_mut(&root)
            .and_then(|m| m.get_mut(&vaddr.align_down().as_u64()))
        else {
            return false;
        };
        entry.1 = (entry.1 | set) - clear;
        true
    }

    fn flush_tlb(&self, vaddr: VirtualAddress) {
        self.record(MockEvent::TlbFlushPage(vaddr.align_down().as_u64()));
    }

    fn flush_tlb_all(&self) {
        self.record(MockEvent::TlbFlushAll);
    }

    fn parse_fault(&self, raw: RawFault) -> PageFaultInfo {
        fault::decode_arm64(raw.syndrome, raw.address)
    }

    fn irq_enable(&self) {
        self.irq_enabled.store(true, Ordering::Release);
    }

    fn irq_disable(&self) {
        self.irq_enabled.store(false, Ordering::Release);
    }

    fn irq_save(&self) -> IrqState {
        IrqState(self.irq_enabled.swap(false, Ordering::AcqRel))
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

    fn eoi(&self, irq: u32) {
        self.record(MockEvent::Eoi(irq));
    }

    fn cache_clean(&self, _addr: VirtualAddress, _size: usize) {}
    fn cache_invalidate(&self, _addr: VirtualAddress, _size: usize) {}
    fn cache_clean_invalidate(&self, _addr: VirtualAddress, _size: usize) {}

    fn new_context(
        &self,
        entry: VirtualAddress,
        stack_top: VirtualAddress,
        space: AddrSpace,
    ) -> TaskContext {
        TaskContext::Arm64(Arm64Context::new(entry, stack_top, space))
    }

    unsafe fn context_switch(&self, _from: *mut TaskContext, _to: *const TaskContext) {
        // No stack actually changes hands on a host; the scheduler's
        // bookkeeping is what the tests observe.
        self.record(MockEvent::ContextSwitch);
    }

    fn wait_for_interrupt(&self) {
        self.record(MockEvent::Idle);
    }

    fn platform_reset(&self) -> KernelResult<()> {
        self.record(MockEvent::Reset);
        Ok(())
    }

    fn platform_poweroff(&self) -> KernelResult<()> {
        self.record(MockEvent::Poweroff);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Simulated physical memory
// ---------------------------------------------------------------------------

/// A heap-backed physical memory window plus the matching boot record.
///
/// Frames handed out by the arena's [`FrameAllocator`] are real host memory
/// reachable through the arena's [`PhysMapper`], so the x86/ARM page-table
/// walkers operate on genuine tables during tests. Keep the arena alive for
/// as long as any allocator or HAL built over it.
pub struct TestArena {
    base: *mut u8,
    layout: core::alloc::Layout,
    mapper: PhysMapper,
    boot: BootInfo,
}

// SAFETY: the arena owns its allocation; the mapper hands out raw pointers
// but all mutation is synchronized by the structures built on top.
unsafe impl Send for TestArena {}
unsafe impl Sync for TestArena {}

impl TestArena {
    /// Allocate `bytes` of simulated RAM (rounded up to whole pages).
    pub fn new(bytes: usize) -> Self {
        let bytes = bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout = core::alloc::Layout::from_size_align(bytes, PAGE_SIZE)
            .expect("arena layout");
        // SAFETY: layout has non-zero size and valid alignment.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null(), "arena allocation failed");

        // SAFETY: the freshly allocated block backs exactly the advertised
        // physical range for the arena's lifetime.
        let mapper =
            unsafe { PhysMapper::new(base, PhysicalAddress::new(ARENA_PHYS_BASE), bytes) };

        let mut boot = BootInfo::empty();
        boot.push_region(MemoryRegion::new(
            PhysicalAddress::new(ARENA_PHYS_BASE),
            bytes as u64,
            MemoryRegionKind::Usable,
        ));

        Self {
            base,
            layout,
            mapper,
            boot,
        }
    }

    pub fn mapper(&self) -> PhysMapper {
        self.mapper
    }

    pub fn boot(&self) -> &BootInfo {
        &self.boot
    }

    /// Build a frame allocator over the arena.
    pub fn frame_allocator(&self) -> FrameAllocator {
        FrameAllocator::new(&self.boot, self.mapper).expect("arena frame allocator")
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        // SAFETY: base/layout come from the matching alloc_zeroed call.
        unsafe { alloc::alloc::dealloc(self.base, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_map_query_unmap() {
        let arena = TestArena::new(32 * PAGE_SIZE);
        let frames = arena.frame_allocator();
        let hal = MockHal::default();

        let space = hal.create_space(&frames).unwrap();
        let frame = frames.alloc_frame().unwrap();
        let va = VirtualAddress::new(0x1000_0000);

        assert!(hal.map(&frames, space, va, frame, PageFlags::user_data()));
        let (paddr, flags) = hal.query(space, va).unwrap();
        assert_eq!(paddr, frame);
        assert!(flags.contains(PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITE));

        assert_eq!(hal.unmap(space, va), Some(frame));
        assert!(hal.query(space, va).is_none());
    }

    #[test]
    fn mock_cow_clone_increments_refcounts() {
        let arena = TestArena::new(32 * PAGE_SIZE);
        let frames = arena.frame_allocator();
        let hal = MockHal::default();

        let s1 = hal.create_space(&frames).unwrap();
        let frame = frames.alloc_frame().unwrap();
        let va = VirtualAddress::new(0x2000_0000);
        assert!(hal.map(&frames, s1, va, frame, PageFlags::user_data()));

        let s2 = hal.clone_space(&frames, s1).unwrap();
        assert_eq!(frames.refcount(frame), 2);
        for space in [s1, s2] {
            let (p, f) = hal.query(space, va).unwrap();
            assert_eq!(p, frame);
            assert!(f.contains(PageFlags::COW));
            assert!(!f.contains(PageFlags::WRITE));
        }
    }

    #[test]
    fn mock_destroy_active_space_is_busy() {
        let arena = TestArena::new(32 * PAGE_SIZE);
        let frames = arena.frame_allocator();
        let hal = MockHal::default();

        let current = hal.current_space();
        assert!(matches!(
            hal.destroy_space(&frames, current),
            Err(KernelError::Busy { .. })
        ));
    }
}
