//! Hardware abstraction layer
//!
//! One uniform contract over the architecture back-ends: address-space and
//! per-page operations, TLB and cache maintenance, interrupt control, fault
//! normalization, context switching, and a boot-time capability snapshot.
//! The concrete implementation is chosen statically per target
//! ([`ActiveHal`]); higher layers branch on the capability record, never on
//! `cfg(target_arch)`.
//!
//! Both real back-ends are ordinary Rust over the linear physical window,
//! compiled and tested on every target; only the thin `hw` glue modules
//! touch actual registers. [`mock::MockHal`] is the substitutable test
//! double the scheduler and router tests run against.

pub mod arm64;
pub mod context;
pub mod mock;
pub mod x86;

pub use context::TaskContext;

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::{FrameAllocator, PageFaultInfo, PageFlags, PhysicalAddress, VirtualAddress},
};

/// Handle naming one process's address space.
///
/// Internally the root page-table physical address. Two sentinels exist:
/// [`AddrSpace::CURRENT`] ("whatever is active") and [`AddrSpace::INVALID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrSpace(u64);

impl AddrSpace {
    pub const INVALID: AddrSpace = AddrSpace(u64::MAX);
    pub const CURRENT: AddrSpace = AddrSpace(u64::MAX - 1);

    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self(root.as_u64())
    }

    pub const fn root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0)
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID && *self != Self::CURRENT
    }
}

/// Shape of the architecture's register file, for layers that size save
/// areas or argument tuples without arch conditionals.
#[derive(Debug, Clone, Copy)]
pub struct RegisterFile {
    pub gp_registers: u8,
    pub callee_saved: u8,
    pub syscall_args: u8,
}

/// Read-only capability snapshot, fixed at boot.
#[derive(Debug, Clone, Copy)]
pub struct HalCapabilities {
    /// Short machine name reported by uname.
    pub arch_name: &'static str,
    pub huge_pages: bool,
    pub nx: bool,
    pub port_io: bool,
    pub iommu: bool,
    pub smp: bool,
    pub fpu: bool,
    pub simd: bool,
    pub dma_coherent: bool,
    pub page_table_levels: u8,
    pub page_sizes: &'static [usize],
    pub phys_addr_bits: u8,
    pub virt_addr_bits: u8,
    /// Start of the kernel half; everything below is per-process.
    pub kernel_base: VirtualAddress,
    /// Exclusive end of the user half (differs from `kernel_base` on
    /// architectures with a non-canonical hole between the halves).
    pub user_top: VirtualAddress,
    pub register_file: RegisterFile,
    /// Vector numbers the router binds (timer tick, page fault, syscall).
    pub timer_vector: u32,
    pub fault_vector: u32,
    pub syscall_vector: u32,
    /// Kernel-half window the VMM carves MMIO mappings from.
    pub mmio_base: VirtualAddress,
    pub mmio_size: usize,
    /// Kernel-half window for the boundary-tag heap.
    pub heap_base: VirtualAddress,
    pub heap_max_size: usize,
}

/// Raw, arch-encoded fault syndrome as delivered by the trap path.
///
/// x86-like: `syndrome` = pushed error code, `address` = CR2.
/// ARM-like: `syndrome` = ESR, `address` = FAR.
#[derive(Debug, Clone, Copy)]
pub struct RawFault {
    pub syndrome: u64,
    pub address: u64,
}

/// Opaque interrupt-enable state returned by [`Hal::irq_save`].
#[derive(Debug, Clone, Copy)]
pub struct IrqState(pub(crate) bool);

impl IrqState {
    pub fn into_raw(self) -> usize {
        self.0 as usize
    }

    pub fn from_raw(raw: usize) -> Self {
        Self(raw != 0)
    }
}

/// A registered interrupt/exception handler plus its opaque context word.
pub type VectorHandler = fn(vector: u32, context: usize);

/// Number of vector slots every backend carries.
pub const MAX_VECTORS: usize = 256;

#[derive(Clone, Copy)]
struct VectorEntry {
    handler: VectorHandler,
    context: usize,
}

/// Fixed-size vector registry shared by all back-ends.
pub struct VectorTable {
    entries: Mutex<[Option<VectorEntry>; MAX_VECTORS]>,
}

impl VectorTable {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new([None; MAX_VECTORS]),
        }
    }

    pub fn register(
        &self,
        vector: u32,
        handler: VectorHandler,
        context: usize,
    ) -> KernelResult<()> {
        if vector as usize >= MAX_VECTORS {
            return Err(KernelError::InvalidParam {
                what: "vector number out of range",
            });
        }
        let mut entries = self.entries.lock();
        if entries[vector as usize].is_some() {
            return Err(KernelError::AlreadyExists {
                what: "vector handler",
            });
        }
        entries[vector as usize] = Some(VectorEntry { handler, context });
        Ok(())
    }

    pub fn unregister(&self, vector: u32) -> KernelResult<()> {
        if vector as usize >= MAX_VECTORS {
            return Err(KernelError::InvalidParam {
                what: "vector number out of range",
            });
        }
        let mut entries = self.entries.lock();
        if entries[vector as usize].take().is_none() {
            return Err(KernelError::NotFound {
                what: "vector handler",
            });
        }
        Ok(())
    }

    /// Invoke the handler for `vector`. Unregistered vectors are spurious
    /// and ignored.
    pub fn dispatch(&self, vector: u32) -> bool {
        let entry = {
            let entries = self.entries.lock();
            entries.get(vector as usize).copied().flatten()
        };
        match entry {
            Some(e) => {
                (e.handler)(vector, e.context);
                true
            }
            None => false,
        }
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-architecture contract.
///
/// Operations report failure through `bool`/`Option` sentinels; callers in
/// the VMM and scheduler translate into [`KernelError`]. Page-table edits
/// leave TLB invalidation to the caller.
pub trait Hal {
    /// The boot-time capability snapshot.
    fn caps(&self) -> &HalCapabilities;

    // -- address spaces -----------------------------------------------------

    /// The space active on this CPU.
    fn current_space(&self) -> AddrSpace;

    /// The master kernel space (the template every space mirrors its
    /// kernel half from). Kernel-global mappings are installed here.
    fn kernel_space(&self) -> AddrSpace;

    /// Allocate a new space: fresh top-level table, kernel half copied from
    /// the master template, user half empty.
    fn create_space(&self, frames: &FrameAllocator) -> Option<AddrSpace>;

    /// Free the user half (dropping one reference per mapped frame), all
    /// owned intermediate tables, and the top-level table. Destroying the
    /// active space is refused.
    fn destroy_space(&self, frames: &FrameAllocator, space: AddrSpace) -> KernelResult<()>;

    /// Produce a copy-on-write clone: every user-half mapping shares its
    /// frame with `src`, read-only and COW-marked in both, refcounts
    /// incremented. Kernel half is shared. Caller flushes the TLB for `src`.
    fn clone_space(&self, frames: &FrameAllocator, src: AddrSpace) -> Option<AddrSpace>;

    /// Install `space` on the running CPU.
    fn switch_space(&self, space: AddrSpace);

    /// Install the missing kernel-half top-level entry for `vaddr` from the
    /// master template into `space`. Returns false when the template has no
    /// entry either.
    fn sync_kernel_entry(&self, space: AddrSpace, vaddr: VirtualAddress) -> bool;

    // -- per-page operations ------------------------------------------------

    /// Install or overwrite a mapping. Allocates intermediate tables as
    /// needed. Inputs must be page-aligned. Caller flushes the TLB.
    fn map(
        &self,
        frames: &FrameAllocator,
        space: AddrSpace,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: PageFlags,
    ) -> bool;

    /// Remove a mapping, returning the formerly mapped frame for the
    /// caller's refcount bookkeeping. Does not free the frame.
    fn unmap(&self, space: AddrSpace, vaddr: VirtualAddress) -> Option<PhysicalAddress>;

    /// Report the mapping covering `vaddr`, if any.
    fn query(
        &self,
        space: AddrSpace,
        vaddr: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)>;

    /// Atomically set and clear flags on an existing mapping without
    /// changing the frame. Caller flushes the TLB.
    fn protect(
        &self,
        space: AddrSpace,
        vaddr: VirtualAddress,
        set: PageFlags,
        clear: PageFlags,
    ) -> bool;

    fn flush_tlb(&self, vaddr: VirtualAddress);
    fn flush_tlb_all(&self);

    // -- fault normalization ------------------------------------------------

    /// Decode the arch syndrome into the uniform fault record.
    fn parse_fault(&self, raw: RawFault) -> PageFaultInfo;

    // -- interrupt control --------------------------------------------------

    fn irq_enable(&self);
    fn irq_disable(&self);
    /// Capture the current enable state and disable.
    fn irq_save(&self) -> IrqState;
    fn irq_restore(&self, state: IrqState);

    fn register_handler(
        &self,
        vector: u32,
        handler: VectorHandler,
        context: usize,
    ) -> KernelResult<()>;
    fn unregister_handler(&self, vector: u32) -> KernelResult<()>;

    /// Route a vector to its registered handler (trap-glue entry point).
    fn dispatch(&self, vector: u32);

    /// Signal end-of-interrupt; a no-op where the trap itself completes.
    fn eoi(&self, irq: u32);

    // -- cache maintenance (no-ops on coherent architectures) ---------------

    fn cache_clean(&self, addr: VirtualAddress, size: usize);
    fn cache_invalidate(&self, addr: VirtualAddress, size: usize);
    fn cache_clean_invalidate(&self, addr: VirtualAddress, size: usize);

    // -- CPU and context ----------------------------------------------------

    /// Build a fresh kernel-mode context that starts at `entry` on
    /// `stack_top` in `space`.
    fn new_context(
        &self,
        entry: VirtualAddress,
        stack_top: VirtualAddress,
        space: AddrSpace,
    ) -> TaskContext;

    /// Save the outgoing register state into `from` and resume `to`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live, exclusively borrowed contexts and
    /// interrupts must be disabled.
    unsafe fn context_switch(&self, from: *mut TaskContext, to: *const TaskContext);

    /// Park the CPU until the next interrupt.
    fn wait_for_interrupt(&self);

    /// Platform reset / power-off hooks for the system syscalls.
    fn platform_reset(&self) -> KernelResult<()>;
    fn platform_poweroff(&self) -> KernelResult<()>;
}

/// Run `f` with interrupts disabled, restoring the prior state after.
pub fn without_interrupts<H: Hal, R>(hal: &H, f: impl FnOnce() -> R) -> R {
    let state = hal.irq_save();
    let result = f();
    hal.irq_restore(state);
    result
}

/// The statically selected backend for this build.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub type ActiveHal = x86::X86Hal;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub type ActiveHal = arm64::Arm64Hal;

#[cfg(not(target_os = "none"))]
pub type ActiveHal = mock::MockHal;

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_handler(_vector: u32, _context: usize) {}

    #[test]
    fn vector_table_register_unregister() {
        let table = VectorTable::new();
        table.register(32, nop_handler, 0).unwrap();
        assert!(matches!(
            table.register(32, nop_handler, 0),
            Err(KernelError::AlreadyExists { .. })
        ));
        assert!(table.dispatch(32));
        assert!(!table.dispatch(33));

        table.unregister(32).unwrap();
        assert!(matches!(
            table.unregister(32),
            Err(KernelError::NotFound { .. })
        ));
        assert!(!table.dispatch(32));
    }

    #[test]
    fn vector_bounds_checked() {
        let table = VectorTable::new();
        assert!(table.register(4096, nop_handler, 0).is_err());
        assert!(table.unregister(4096).is_err());
    }

    #[test]
    fn addr_space_sentinels() {
        assert!(!AddrSpace::INVALID.is_valid());
        assert!(!AddrSpace::CURRENT.is_valid());
        assert!(AddrSpace::from_root(PhysicalAddress::new(0x1000)).is_valid());
    }
}
