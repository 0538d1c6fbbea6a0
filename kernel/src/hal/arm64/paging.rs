//! Four-level ARM64 translation tables
//!
//! 4 KiB granule, 48-bit addressing, 512 64-bit descriptors per table.
//! The upper 256 root slots are the kernel half, mirrored from the master
//! template. Descriptors follow the VMSAv8-64 page format with software
//! bits for the COW marker and the dirty flag.

use crate::mm::{
    FrameAllocator, PageFlags, PhysMapper, PhysicalAddress, VirtualAddress, PAGE_SHIFT,
};

/// Start of the kernel half of every address space.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Descriptors per table.
pub const ENTRIES: usize = 512;

/// First root-table index of the kernel half (bit 47 set).
pub const KERNEL_L0_FIRST: usize = 256;

/// Translation levels below the root.
pub const LEVELS: usize = 4;

// Descriptor bits.
const DESC_VALID: u64 = 1 << 0;
/// Table at levels 0-2; page at level 3.
const DESC_TABLE_OR_PAGE: u64 = 1 << 1;
/// MAIR index 1 = device memory (index 0 = normal write-back).
const DESC_ATTR_DEVICE: u64 = 1 << 2;
/// EL0 accessible.
const DESC_AP_EL0: u64 = 1 << 6;
/// Read-only at all levels.
const DESC_AP_RO: u64 = 1 << 7;
/// Inner shareable.
const DESC_SH_INNER: u64 = 0b11 << 8;
/// Access flag; faults on access when clear.
const DESC_AF: u64 = 1 << 10;
const DESC_PXN: u64 = 1 << 53;
const DESC_UXN: u64 = 1 << 54;
// Software bits (55-58 are ignored by hardware).
const DESC_COW: u64 = 1 << 55;
const DESC_DIRTY: u64 = 1 << 56;

const DESC_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

const TABLE_DESC: u64 = DESC_VALID | DESC_TABLE_OR_PAGE;

/// Mask a virtual address down to the translated bits [47:0]; the upper
/// bits only carry the canonical sign extension.
fn va_bits(vaddr: VirtualAddress) -> u64 {
    vaddr.as_u64() & 0x0000_FFFF_FFFF_FFFF
}

/// Table index at `level` (0 = root) for `vaddr`.
pub fn index_at(level: usize, vaddr: VirtualAddress) -> usize {
    debug_assert!(level < LEVELS);
    let shift = PAGE_SHIFT as u64 + 9 * (LEVELS - 1 - level) as u64;
    ((va_bits(vaddr) >> shift) & 0x1FF) as usize
}

pub fn entry_addr(desc: u64) -> PhysicalAddress {
    PhysicalAddress::new(desc & DESC_ADDR_MASK)
}

pub fn entry_present(desc: u64) -> bool {
    desc & DESC_VALID != 0
}

/// Encode HAL flags into a level-3 page descriptor for `paddr`.
///
/// The access flag is set eagerly so fresh mappings do not take an aging
/// fault on first touch; `COW` forces the read-only bit.
pub fn make_entry(paddr: PhysicalAddress, flags: PageFlags) -> u64 {
    let mut desc = paddr.as_u64() & DESC_ADDR_MASK;
    if flags.contains(PageFlags::PRESENT) {
        desc |= DESC_VALID | DESC_TABLE_OR_PAGE | DESC_SH_INNER | DESC_AF;
    }
    if !flags.contains(PageFlags::WRITE) || flags.contains(PageFlags::COW) {
        desc |= DESC_AP_RO;
    }
    if flags.contains(PageFlags::USER) {
        desc |= DESC_AP_EL0;
    }
    if flags.contains(PageFlags::NOCACHE) {
        desc |= DESC_ATTR_DEVICE;
    }
    if !flags.contains(PageFlags::EXEC) {
        desc |= DESC_UXN | DESC_PXN;
    }
    if flags.contains(PageFlags::COW) {
        desc |= DESC_COW;
    }
    if flags.contains(PageFlags::DIRTY) {
        desc |= DESC_DIRTY;
    }
    desc
}

/// Decode a level-3 descriptor back into HAL flags.
pub fn entry_flags(desc: u64) -> PageFlags {
    let mut flags = PageFlags::empty();
    if desc & DESC_VALID != 0 {
        flags |= PageFlags::PRESENT;
    }
    if desc & DESC_AP_RO == 0 && desc & DESC_VALID != 0 {
        flags |= PageFlags::WRITE;
    }
    if desc & DESC_AP_EL0 != 0 {
        flags |= PageFlags::USER;
    }
    if desc & DESC_ATTR_DEVICE != 0 {
        flags |= PageFlags::NOCACHE;
    }
    if desc & DESC_UXN == 0 && desc & DESC_VALID != 0 {
        flags |= PageFlags::EXEC;
    }
    if desc & DESC_COW != 0 {
        flags |= PageFlags::COW;
    }
    if desc & DESC_DIRTY != 0 {
        flags |= PageFlags::DIRTY;
    }
    if desc & DESC_AF != 0 {
        flags |= PageFlags::ACCESSED;
    }
    flags
}

/// Apply the COW sharing transform to a page descriptor.
pub fn make_cow(desc: u64) -> u64 {
    (desc | DESC_AP_RO) | DESC_COW
}

/// Pointer to descriptor `index` of the table at `table`.
///
/// # Safety
///
/// `table` must be a live translation-table frame inside the mapper's
/// window.
pub unsafe fn entry_ptr(mapper: &PhysMapper, table: PhysicalAddress, index: usize) -> *mut u64 {
    debug_assert!(index < ENTRIES);
    // SAFETY: translate() bounds-checks; index stays within the frame.
    unsafe { (mapper.translate(table) as *mut u64).add(index) }
}

/// Walk to the level-3 descriptor slot for `vaddr`, if all intermediate
/// tables exist.
pub fn walk(
    mapper: &PhysMapper,
    root: PhysicalAddress,
    vaddr: VirtualAddress,
) -> Option<*mut u64> {
    let mut table = root;
    for level in 0..LEVELS - 1 {
        // SAFETY: table frames come from valid descriptors; indices masked.
        let desc = unsafe { *entry_ptr(mapper, table, index_at(level, vaddr)) };
        if !entry_present(desc) {
            return None;
        }
        table = entry_addr(desc);
    }
    // SAFETY: final table is live; index masked.
    Some(unsafe { entry_ptr(mapper, table, index_at(LEVELS - 1, vaddr)) })
}

/// Walk to the level-3 descriptor slot for `vaddr`, allocating missing
/// intermediate tables.
pub fn walk_create(
    mapper: &PhysMapper,
    frames: &FrameAllocator,
    root: PhysicalAddress,
    vaddr: VirtualAddress,
) -> Option<*mut u64> {
    let mut table = root;
    for level in 0..LEVELS - 1 {
        // SAFETY: table frames come from valid descriptors; indices masked.
        unsafe {
            let slot = entry_ptr(mapper, table, index_at(level, vaddr));
            if !entry_present(*slot) {
                let next = frames.alloc_zeroed_frame()?;
                *slot = (next.as_u64() & DESC_ADDR_MASK) | TABLE_DESC;
            }
            table = entry_addr(*slot);
        }
    }
    // SAFETY: final table is live; index masked.
    Some(unsafe { entry_ptr(mapper, table, index_at(LEVELS - 1, vaddr)) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_base_indexes_upper_half() {
        let v = VirtualAddress::new(KERNEL_BASE);
        assert_eq!(index_at(0, v), KERNEL_L0_FIRST);

        let u = VirtualAddress::new(0x0000_7FFF_FFFF_F000);
        assert!(index_at(0, u) < KERNEL_L0_FIRST);
    }

    #[test]
    fn index_split() {
        // 0x40201000: L0 0, L1 1, L2 17, L3 1.
        let v = VirtualAddress::new(0x4020_1000);
        assert_eq!(index_at(0, v), 0);
        assert_eq!(index_at(1, v), 1);
        assert_eq!(index_at(2, v), 0x201000 >> 21);
        assert_eq!(index_at(3, v), 1);
    }

    #[test]
    fn nx_round_trips() {
        let p = PhysicalAddress::new(0x8000);
        let exec = make_entry(p, PageFlags::PRESENT | PageFlags::USER | PageFlags::EXEC);
        assert!(entry_flags(exec).contains(PageFlags::EXEC));

        let noexec = make_entry(p, PageFlags::user_data());
        assert!(!entry_flags(noexec).contains(PageFlags::EXEC));
    }

    #[test]
    fn cow_encoding_clears_write() {
        let p = PhysicalAddress::new(0x9000);
        let writable = make_entry(p, PageFlags::user_data());
        assert!(entry_flags(writable).contains(PageFlags::WRITE));

        let shared = make_cow(writable);
        let flags = entry_flags(shared);
        assert!(flags.contains(PageFlags::COW));
        assert!(!flags.contains(PageFlags::WRITE));
        assert_eq!(entry_addr(shared), p);
    }

    #[test]
    fn access_flag_reports_accessed() {
        let p = PhysicalAddress::new(0xA000);
        let desc = make_entry(p, PageFlags::PRESENT);
        assert!(entry_flags(desc).contains(PageFlags::ACCESSED));
    }
}
