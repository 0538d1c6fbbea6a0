//! Address-space and frame-allocator integration tests, run against both
//! real page-table backends over a simulated physical memory arena.

use nimbus_kernel::{
    hal::{arm64::Arm64Hal, mock::TestArena, x86::X86Hal, AddrSpace, Hal},
    mm::{FrameAllocator, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE},
};

const ARENA_BYTES: usize = 512 * PAGE_SIZE;

fn x86_fixture() -> (TestArena, FrameAllocator) {
    let arena = TestArena::new(ARENA_BYTES);
    let frames = arena.frame_allocator();
    (arena, frames)
}

/// Scenario: create a space, allocate a frame, map, query, unmap, free,
/// and watch the refcount walk 1 -> 0.
fn map_query_unmap_cycle<H: Hal>(hal: &H, frames: &FrameAllocator) {
    let space = hal.create_space(frames).expect("create_space");
    let frame = frames.alloc_frame().expect("alloc_frame");
    assert_eq!(frames.refcount(frame), 1);

    let va = VirtualAddress::new(0x1000_0000);
    let flags = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITE;
    assert!(hal.map(frames, space, va, frame, flags));

    let (paddr, got) = hal.query(space, va).expect("query after map");
    assert_eq!(paddr, frame);
    assert!(got.contains(flags));

    assert_eq!(hal.unmap(space, va), Some(frame));
    assert!(hal.query(space, va).is_none());

    frames.free_frame(frame);
    assert_eq!(frames.refcount(frame), 0);

    hal.destroy_space(frames, space).expect("destroy_space");
}

#[test]
fn map_query_unmap_cycle_x86() {
    let (arena, frames) = x86_fixture();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();
    map_query_unmap_cycle(&hal, &frames);
}

#[test]
fn map_query_unmap_cycle_arm64() {
    let (arena, frames) = x86_fixture();
    let hal = Arm64Hal::new(arena.mapper(), &frames).unwrap();
    map_query_unmap_cycle(&hal, &frames);
}

/// PTE round-trip: for every legal flag combination, a query after map
/// reports at least the requested flags minus the hardware-managed pair.
fn pte_round_trip<H: Hal>(hal: &H, frames: &FrameAllocator) {
    let combos = [
        PageFlags::PRESENT,
        PageFlags::PRESENT | PageFlags::USER,
        PageFlags::PRESENT | PageFlags::WRITE,
        PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITE,
        PageFlags::PRESENT | PageFlags::USER | PageFlags::EXEC,
        PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITE | PageFlags::EXEC,
        PageFlags::PRESENT | PageFlags::WRITE | PageFlags::NOCACHE,
        PageFlags::PRESENT | PageFlags::USER | PageFlags::COW,
        PageFlags::PRESENT | PageFlags::WRITE | PageFlags::DIRTY | PageFlags::ACCESSED,
    ];

    let space = hal.create_space(frames).expect("create_space");
    for (i, &flags) in combos.iter().enumerate() {
        let frame = frames.alloc_frame().expect("alloc_frame");
        let va = VirtualAddress::new(0x2000_0000 + (i * PAGE_SIZE) as u64);
        assert!(hal.map(frames, space, va, frame, flags), "map {:?}", flags);

        let (paddr, got) = hal.query(space, va).expect("query");
        assert_eq!(paddr, frame);
        let expected = flags - (PageFlags::DIRTY | PageFlags::ACCESSED);
        assert!(
            got.contains(expected),
            "round trip lost flags: asked {:?}, got {:?}",
            flags,
            got
        );
    }
    hal.destroy_space(frames, space).expect("destroy_space");
}

#[test]
fn pte_round_trip_x86() {
    let (arena, frames) = x86_fixture();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();
    pte_round_trip(&hal, &frames);
}

#[test]
fn pte_round_trip_arm64() {
    let (arena, frames) = x86_fixture();
    let hal = Arm64Hal::new(arena.mapper(), &frames).unwrap();
    pte_round_trip(&hal, &frames);
}

/// User halves of two spaces may differ at the same address; the kernel
/// half is identical by construction.
fn address_space_isolation<H: Hal>(hal: &H, frames: &FrameAllocator, kernel_probe: u64) {
    // A kernel-global mapping installed before the spaces exist.
    let kva = VirtualAddress::new(kernel_probe);
    let kframe = frames.alloc_frame().unwrap();
    assert!(hal.map(frames, hal.kernel_space(), kva, kframe, PageFlags::kernel_data()));

    let a = hal.create_space(frames).unwrap();
    let b = hal.create_space(frames).unwrap();

    let uva = VirtualAddress::new(0x3000_0000);
    let fa = frames.alloc_frame().unwrap();
    let fb = frames.alloc_frame().unwrap();
    assert!(hal.map(frames, a, uva, fa, PageFlags::user_data()));
    assert!(hal.map(frames, b, uva, fb, PageFlags::user_data()));

    // User half: different physical pages at the same address.
    assert_ne!(hal.query(a, uva).unwrap().0, hal.query(b, uva).unwrap().0);

    // Kernel half: identical mapping in both.
    assert_eq!(hal.query(a, kva).unwrap().0, kframe);
    assert_eq!(hal.query(b, kva).unwrap().0, kframe);
}

#[test]
fn address_space_isolation_x86() {
    let (arena, frames) = x86_fixture();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();
    address_space_isolation(&hal, &frames, 0xC040_0000);
}

#[test]
fn address_space_isolation_arm64() {
    let (arena, frames) = x86_fixture();
    let hal = Arm64Hal::new(arena.mapper(), &frames).unwrap();
    address_space_isolation(&hal, &frames, 0xFFFF_8000_4000_0000);
}

/// Destroying spaces returns every frame: user data frames drop one
/// reference per mapping, page-table frames free unconditionally.
fn destroy_returns_all_frames<H: Hal>(hal: &H, frames: &FrameAllocator) {
    let baseline = frames.free_frames();

    let space = hal.create_space(frames).unwrap();
    for i in 0..16u64 {
        let frame = frames.alloc_frame().unwrap();
        let va = VirtualAddress::new(0x1000_0000 + i * PAGE_SIZE as u64);
        assert!(hal.map(frames, space, va, frame, PageFlags::user_data()));
    }
    let clone = hal.clone_space(frames, space).unwrap();
    assert!(frames.free_frames() < baseline);

    hal.destroy_space(frames, clone).unwrap();
    hal.destroy_space(frames, space).unwrap();
    assert_eq!(frames.free_frames(), baseline);
}

#[test]
fn destroy_returns_all_frames_x86() {
    let (arena, frames) = x86_fixture();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();
    destroy_returns_all_frames(&hal, &frames);
}

#[test]
fn destroy_returns_all_frames_arm64() {
    let (arena, frames) = x86_fixture();
    let hal = Arm64Hal::new(arena.mapper(), &frames).unwrap();
    destroy_returns_all_frames(&hal, &frames);
}

/// Destroying the active space is refused.
#[test]
fn destroy_active_space_is_busy() {
    let (arena, frames) = x86_fixture();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();

    let space = hal.create_space(&frames).unwrap();
    hal.switch_space(space);
    assert!(hal.destroy_space(&frames, space).is_err());

    // After switching away it can go.
    hal.switch_space(hal.kernel_space());
    assert!(hal.destroy_space(&frames, space).is_ok());
}

/// The 32-bit backend refuses addresses beyond its reach; the invalid
/// handle sentinels never map.
#[test]
fn x86_rejects_out_of_range() {
    let (arena, frames) = x86_fixture();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();
    let space = hal.create_space(&frames).unwrap();
    let frame = frames.alloc_frame().unwrap();

    assert!(!hal.map(
        &frames,
        space,
        VirtualAddress::new(0x1_0000_0000),
        frame,
        PageFlags::user_data()
    ));
    assert!(!hal.map(
        &frames,
        AddrSpace::INVALID,
        VirtualAddress::new(0x1000),
        frame,
        PageFlags::user_data()
    ));
    assert!(hal.query(space, VirtualAddress::new(0x1_0000_0000)).is_none());
}

/// protect() flips flags without changing the frame.
#[test]
fn protect_modifies_flags_in_place() {
    let (arena, frames) = x86_fixture();
    let hal = Arm64Hal::new(arena.mapper(), &frames).unwrap();
    let space = hal.create_space(&frames).unwrap();
    let frame = frames.alloc_frame().unwrap();
    let va = VirtualAddress::new(0x4000_0000);

    assert!(hal.map(&frames, space, va, frame, PageFlags::user_data()));
    assert!(hal.protect(space, va, PageFlags::COW, PageFlags::WRITE));

    let (paddr, flags) = hal.query(space, va).unwrap();
    assert_eq!(paddr, frame);
    assert!(flags.contains(PageFlags::COW));
    assert!(!flags.contains(PageFlags::WRITE));

    assert!(hal.protect(space, va, PageFlags::WRITE, PageFlags::COW));
    let (_, flags) = hal.query(space, va).unwrap();
    assert!(flags.contains(PageFlags::WRITE));
    assert!(!flags.contains(PageFlags::COW));
}

/// get_refcount on the invalid sentinel is zero (never panics).
#[test]
fn refcount_of_invalid_is_zero() {
    let (_arena, frames) = x86_fixture();
    assert_eq!(frames.refcount(PhysicalAddress::INVALID), 0);
}
