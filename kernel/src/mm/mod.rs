//! Memory management
//!
//! Address newtypes and the architecture-independent page-flag set, plus the
//! submodules for physical frames, the kernel heap, the VMM, and page-fault
//! normalization.

pub mod fault;
pub mod frame;
pub mod heap;
pub mod phys;
pub mod vmm;

pub use fault::PageFaultInfo;
pub use frame::FrameAllocator;
pub use phys::PhysMapper;
pub use vmm::Vmm;

use bitflags::bitflags;

/// Size of one page / physical frame.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Physical memory address.
///
/// Full-width (`u64`) on both architectures; the 32-bit backend validates
/// range at its boundary. Not interchangeable with plain integers except
/// through `new`/`as_u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// Sentinel for "no frame" in HAL-facing interfaces.
    pub const INVALID: PhysicalAddress = PhysicalAddress(u64::MAX);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn frame_number(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    pub const fn offset(&self, delta: u64) -> Self {
        Self(self.0 + delta)
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn align_up(&self) -> Self {
        Self((self.0 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE as u64 - 1)
    }

    pub const fn offset(&self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

bitflags! {
    /// Architecture-independent page mapping flags.
    ///
    /// Each backend translates these into its own PTE encoding; the
    /// translation is round-trip faithful for everything except `DIRTY` and
    /// `ACCESSED`, which hardware may set on its own.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const EXEC     = 1 << 3;
        const NOCACHE  = 1 << 4;
        /// Copy-on-write marker. `PRESENT | COW` implies `WRITE` is clear.
        const COW      = 1 << 5;
        const DIRTY    = 1 << 6;
        const ACCESSED = 1 << 7;
    }
}

impl PageFlags {
    /// Flags for an ordinary writable kernel data page.
    pub fn kernel_data() -> Self {
        Self::PRESENT | Self::WRITE
    }

    /// Flags for an ordinary writable user data page.
    pub fn user_data() -> Self {
        Self::PRESENT | Self::WRITE | Self::USER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_alignment_helpers() {
        let v = VirtualAddress::new(0x2000_0123);
        assert!(!v.is_page_aligned());
        assert_eq!(v.align_down().as_u64(), 0x2000_0000);
        assert_eq!(v.align_up().as_u64(), 0x2000_1000);
        assert_eq!(v.page_offset(), 0x123);

        let p = PhysicalAddress::new(0x5000);
        assert!(p.is_page_aligned());
        assert_eq!(p.frame_number(), 5);
    }

    #[test]
    fn invalid_sentinel() {
        assert!(!PhysicalAddress::INVALID.is_valid());
        assert!(PhysicalAddress::new(0).is_valid());
    }
}
