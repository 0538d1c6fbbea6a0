//! Two-level x86 page tables
//!
//! Page directory and page tables of 1024 32-bit entries each. The kernel
//! half starts at 3 GiB; its directory entries are mirrored across address
//! spaces and point into page tables owned by the master template. The COW
//! marker uses one of the software-available PTE bits.

use crate::mm::{
    FrameAllocator, PageFlags, PhysMapper, PhysicalAddress, VirtualAddress, PAGE_SHIFT,
};

/// Start of the kernel half of every address space.
pub const KERNEL_BASE: u64 = 0xC000_0000;

/// Entries per directory/table.
pub const ENTRIES: usize = 1024;

/// First page-directory index of the kernel half.
pub const KERNEL_PDE_FIRST: usize = (KERNEL_BASE >> 22) as usize;

// Hardware PTE bits.
const PTE_PRESENT: u32 = 1 << 0;
const PTE_WRITE: u32 = 1 << 1;
const PTE_USER: u32 = 1 << 2;
const PTE_PWT: u32 = 1 << 3;
const PTE_PCD: u32 = 1 << 4;
const PTE_ACCESSED: u32 = 1 << 5;
const PTE_DIRTY: u32 = 1 << 6;
// Software-available bit (9-11 are ignored by the MMU).
const PTE_COW: u32 = 1 << 9;

const PTE_ADDR_MASK: u32 = 0xFFFF_F000;

/// Directory/table flags for intermediate entries: the leaf governs access,
/// so intermediates stay maximally permissive.
const PDE_TABLE_FLAGS: u32 = PTE_PRESENT | PTE_WRITE | PTE_USER;

/// Whether an address fits the 32-bit space this backend translates.
pub fn addr_in_range(value: u64) -> bool {
    value < (1u64 << 32)
}

pub fn pde_index(vaddr: VirtualAddress) -> usize {
    ((vaddr.as_u64() >> 22) & 0x3FF) as usize
}

pub fn pte_index(vaddr: VirtualAddress) -> usize {
    ((vaddr.as_u64() >> PAGE_SHIFT) & 0x3FF) as usize
}

pub fn entry_addr(entry: u32) -> PhysicalAddress {
    PhysicalAddress::new((entry & PTE_ADDR_MASK) as u64)
}

pub fn entry_present(entry: u32) -> bool {
    entry & PTE_PRESENT != 0
}

/// Encode HAL flags into a PTE for `paddr`.
///
/// No NX on this architecture: `EXEC` has no encoding and is implied by
/// `PRESENT` when decoding. `COW` forces the write bit clear.
pub fn make_entry(paddr: PhysicalAddress, flags: PageFlags) -> u32 {
    let mut entry = (paddr.as_u64() as u32) & PTE_ADDR_MASK;
    if flags.contains(PageFlags::PRESENT) {
        entry |= PTE_PRESENT;
    }
    if flags.contains(PageFlags::WRITE) && !flags.contains(PageFlags::COW) {
        entry |= PTE_WRITE;
    }
    if flags.contains(PageFlags::USER) {
        entry |= PTE_USER;
    }
    if flags.contains(PageFlags::NOCACHE) {
        entry |= PTE_PCD | PTE_PWT;
    }
    if flags.contains(PageFlags::COW) {
        entry |= PTE_COW;
    }
    if flags.contains(PageFlags::DIRTY) {
        entry |= PTE_DIRTY;
    }
    if flags.contains(PageFlags::ACCESSED) {
        entry |= PTE_ACCESSED;
    }
    entry
}

/// Decode a PTE back into HAL flags.
pub fn entry_flags(entry: u32) -> PageFlags {
    let mut flags = PageFlags::empty();
    if entry & PTE_PRESENT != 0 {
        // Everything mapped is executable here; report it so capability
        // checks upstream see the truth.
        flags |= PageFlags::PRESENT | PageFlags::EXEC;
    }
    if entry & PTE_WRITE != 0 {
        flags |= PageFlags::WRITE;
    }
    if entry & PTE_USER != 0 {
        flags |= PageFlags::USER;
    }
    if entry & PTE_PCD != 0 {
        flags |= PageFlags::NOCACHE;
    }
    if entry & PTE_COW != 0 {
        flags |= PageFlags::COW;
    }
    if entry & PTE_DIRTY != 0 {
        flags |= PageFlags::DIRTY;
    }
    if entry & PTE_ACCESSED != 0 {
        flags |= PageFlags::ACCESSED;
    }
    flags
}

/// Apply the COW sharing transform to a leaf entry: write bit off, COW on.
pub fn make_cow(entry: u32) -> u32 {
    (entry & !PTE_WRITE) | PTE_COW
}

/// Pointer to entry `index` of the table at `table`.
///
/// # Safety
///
/// `table` must be a live page-table frame inside the mapper's window.
pub unsafe fn entry_ptr(mapper: &PhysMapper, table: PhysicalAddress, index: usize) -> *mut u32 {
    debug_assert!(index < ENTRIES);
    // SAFETY: translate() bounds-checks; index stays within the frame.
    unsafe { (mapper.translate(table) as *mut u32).add(index) }
}

/// Walk to the PTE slot for `vaddr`, if the covering page table exists.
pub fn walk(
    mapper: &PhysMapper,
    root: PhysicalAddress,
    vaddr: VirtualAddress,
) -> Option<*mut u32> {
    if !addr_in_range(vaddr.as_u64()) {
        return None;
    }
    // SAFETY: root is a live table frame; indices are masked to range.
    unsafe {
        let pde = *entry_ptr(mapper, root, pde_index(vaddr));
        if !entry_present(pde) {
            return None;
        }
        Some(entry_ptr(mapper, entry_addr(pde), pte_index(vaddr)))
    }
}

/// Walk to the PTE slot for `vaddr`, allocating the page table if missing.
pub fn walk_create(
    mapper: &PhysMapper,
    frames: &FrameAllocator,
    root: PhysicalAddress,
    vaddr: VirtualAddress,
) -> Option<*mut u32> {
    if !addr_in_range(vaddr.as_u64()) {
        return None;
    }
    // SAFETY: root is a live table frame; indices are masked to range.
    unsafe {
        let pde_slot = entry_ptr(mapper, root, pde_index(vaddr));
        if !entry_present(*pde_slot) {
            let table = frames.alloc_zeroed_frame()?;
            *pde_slot = (table.as_u64() as u32 & PTE_ADDR_MASK) | PDE_TABLE_FLAGS;
        }
        Some(entry_ptr(mapper, entry_addr(*pde_slot), pte_index(vaddr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_correctly() {
        let v = VirtualAddress::new(0xC040_3000);
        assert_eq!(pde_index(v), 769);
        assert_eq!(pte_index(v), 3);
        assert_eq!(KERNEL_PDE_FIRST, 768);
    }

    #[test]
    fn cow_encoding_clears_write() {
        let p = PhysicalAddress::new(0x5000);
        let entry = make_entry(p, PageFlags::user_data() | PageFlags::COW);
        let flags = entry_flags(entry);
        assert!(flags.contains(PageFlags::COW));
        assert!(!flags.contains(PageFlags::WRITE));

        let writable = make_entry(p, PageFlags::user_data());
        let shared = make_cow(writable);
        assert!(!entry_flags(shared).contains(PageFlags::WRITE));
        assert!(entry_flags(shared).contains(PageFlags::COW));
        assert_eq!(entry_addr(shared), p);
    }

    #[test]
    fn exec_is_implied_by_present() {
        let p = PhysicalAddress::new(0x2000);
        let entry = make_entry(p, PageFlags::PRESENT | PageFlags::USER);
        assert!(entry_flags(entry).contains(PageFlags::EXEC));
    }

    #[test]
    fn nocache_round_trips() {
        let p = PhysicalAddress::new(0x3000);
        let entry = make_entry(p, PageFlags::PRESENT | PageFlags::WRITE | PageFlags::NOCACHE);
        assert!(entry_flags(entry).contains(PageFlags::NOCACHE));
    }
}
